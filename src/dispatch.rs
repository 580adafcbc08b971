use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use ulid::Ulid;

use crate::error::Error;
use crate::limits::{MAX_COUNTER_ATTEMPTS, MAX_PUSH_TOKENS_PER_USER};
use crate::model::{now_ms, Notification, NotificationKind};
use crate::observability;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug)]
pub enum PushError {
    /// The device token is expired or unregistered.
    TokenInvalid,
    Unavailable(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::TokenInvalid => write!(f, "push token invalid"),
            PushError::Unavailable(e) => write!(f, "push channel unavailable: {e}"),
        }
    }
}

impl std::error::Error for PushError {}

/// Token-based push delivery. Tokens are registered and revoked outside the
/// booking subsystem; delivery failure is never allowed to fail a booking.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn deliver(&self, token: &str, title: &str, body: &str, data: &Value) -> Result<(), PushError>;
}

/// Creates persisted notification records for booking lifecycle events and
/// fans them out best-effort through the push channel.
pub struct NotificationDispatcher {
    store: Arc<dyn DocumentStore>,
    push: Arc<dyn PushChannel>,
}

fn notification_key(id: Ulid) -> String {
    format!("notification/{id}")
}

fn token_prefix(user_id: Ulid) -> String {
    format!("push_token/{user_id}/")
}

fn token_key(user_id: Ulid, token: &str) -> String {
    format!("push_token/{user_id}/{token}")
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, push: Arc<dyn PushChannel>) -> Self {
        Self { store, push }
    }

    /// Persist a notification, then attempt push delivery to every token the
    /// user has registered. The persisted record is the source of truth;
    /// push failures are logged and counted, never propagated.
    pub async fn notify(&self, user_id: Ulid, kind: NotificationKind, payload: Value) -> Result<Ulid, Error> {
        let notification = Notification {
            id: Ulid::new(),
            user_id,
            title: kind.title().to_string(),
            message: kind.message().to_string(),
            kind,
            read: false,
            created_at: now_ms(),
            data: Some(payload.clone()),
        };
        self.store
            .create(&notification_key(notification.id), serde_json::to_value(&notification)?)
            .await?;
        metrics::counter!(observability::NOTIFICATIONS_CREATED_TOTAL).increment(1);

        let tokens = self.store.list_prefix(&token_prefix(user_id)).await?;
        let deliveries = tokens.iter().filter_map(|(key, doc)| {
            let token = doc.value.as_str()?;
            let payload = &payload;
            Some(async move {
                let result = self.push.deliver(token, kind.title(), kind.message(), payload).await;
                (key, result)
            })
        });
        for (key, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {}
                Err(PushError::TokenInvalid) => {
                    metrics::counter!(observability::PUSH_FAILURES_TOTAL).increment(1);
                    tracing::warn!("dropping invalid push token for {user_id}");
                    // token is dead; stop retrying it on future events
                    self.store.delete(key).await?;
                }
                Err(e) => {
                    metrics::counter!(observability::PUSH_FAILURES_TOTAL).increment(1);
                    tracing::warn!("push delivery failed for {user_id}: {e}");
                }
            }
        }

        Ok(notification.id)
    }

    pub async fn get(&self, id: Ulid) -> Result<Notification, Error> {
        let doc = self
            .store
            .get(&notification_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("notification {id}")))?;
        Ok(serde_json::from_value(doc.value)?)
    }

    /// Notifications for one user, newest first.
    pub async fn for_user(&self, user_id: Ulid) -> Result<Vec<Notification>, Error> {
        let mut out = Vec::new();
        for (_, doc) in self.store.list_prefix("notification/").await? {
            let n: Notification = serde_json::from_value(doc.value)?;
            if n.user_id == user_id {
                out.push(n);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    /// The only mutation a notification supports after creation.
    pub async fn mark_read(&self, id: Ulid) -> Result<(), Error> {
        let key = notification_key(id);
        for _ in 0..MAX_COUNTER_ATTEMPTS {
            let doc = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("notification {id}")))?;
            let mut n: Notification = serde_json::from_value(doc.value)?;
            if n.read {
                return Ok(());
            }
            n.read = true;
            match self
                .store
                .compare_and_put(&key, doc.version, serde_json::to_value(&n)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Timeout("notification contention"))
    }

    pub async fn register_token(&self, user_id: Ulid, token: &str) -> Result<(), Error> {
        if token.is_empty() {
            return Err(Error::InvalidRequest("empty push token"));
        }
        if self.store.get(&token_key(user_id, token)).await?.is_some() {
            return Ok(());
        }
        if self.store.list_prefix(&token_prefix(user_id)).await?.len() >= MAX_PUSH_TOKENS_PER_USER {
            return Err(Error::InvalidRequest("too many push tokens"));
        }
        match self.store.create(&token_key(user_id, token), json!(token)).await {
            Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn revoke_token(&self, user_id: Ulid, token: &str) -> Result<(), Error> {
        self.store.delete(&token_key(user_id, token)).await?;
        Ok(())
    }
}
