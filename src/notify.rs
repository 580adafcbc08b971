use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use ulid::Ulid;

use crate::error::Error;
use crate::model::{Booking, DayAvailability, DayDate};
use crate::observability;

/// What a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// All bookings of one user.
    UserBookings(Ulid),
    /// Availability of one resource on one date.
    ResourceDay(Ulid, DayDate),
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::UserBookings(user) => write!(f, "bookings/{user}"),
            StreamKey::ResourceDay(resource, date) => write!(f, "availability/{resource}/{date}"),
        }
    }
}

/// A point-in-time view of a stream. `revision` is monotone per key and
/// assigned from store document versions, so it reflects commit order.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: u64,
    pub data: SnapshotData,
}

#[derive(Debug, Clone)]
pub enum SnapshotData {
    Availability(DayAvailability),
    Bookings(Vec<Booking>),
}

/// Loads the current snapshot of a stream when a subscriber arrives before
/// any publish has primed the channel.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load(&self, key: &StreamKey) -> Result<Snapshot, Error>;
}

/// Live subscription. Dropping the handle cancels it; `cancel` is idempotent
/// and safe to call from inside the update callback (the abort lands at the
/// next await point).
pub struct SubscriptionHandle {
    task: tokio::task::AbortHandle,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            metrics::gauge!(observability::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        }
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Decrements the active-subscriptions gauge exactly once, whether the
/// subscriber task is aborted or runs to completion.
struct GaugeGuard {
    active: Arc<AtomicBool>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            metrics::gauge!(observability::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        }
    }
}

/// Per-key broadcast of state snapshots over `watch` channels.
///
/// `watch` gives the delivery contract for free: writers never block on
/// subscribers, a slow subscriber sees a coalesced latest value instead of a
/// backlog, and the monotonic-revision guard in `publish` means nobody can
/// observe a stale snapshot after a fresh one.
pub struct ChangeNotifier {
    channels: DashMap<StreamKey, watch::Sender<Option<Snapshot>>>,
    source: Arc<dyn SnapshotSource>,
}

fn offer(sender: &watch::Sender<Option<Snapshot>>, snapshot: Snapshot) -> bool {
    sender.send_if_modified(|current| match current {
        Some(existing) if snapshot.revision <= existing.revision => false,
        _ => {
            *current = Some(snapshot);
            true
        }
    })
}

impl ChangeNotifier {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            channels: DashMap::new(),
            source,
        }
    }

    fn sender(&self, key: StreamKey) -> watch::Sender<Option<Snapshot>> {
        self.channels
            .entry(key)
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Offer a snapshot to the stream. Discarded if its revision does not
    /// advance the stream. No-op if nobody ever touched the key.
    pub fn publish(&self, key: StreamKey, snapshot: Snapshot) {
        offer(&self.sender(key), snapshot);
    }

    /// Raw receiver for callers that want to poll the stream themselves.
    pub fn watch(&self, key: StreamKey) -> watch::Receiver<Option<Snapshot>> {
        self.sender(key).subscribe()
    }

    /// Deliver the current snapshot immediately, then every change, until
    /// cancelled. Each subscription runs on its own task; subscriptions on
    /// the same key never block each other or the writers.
    pub fn subscribe<F>(&self, key: StreamKey, mut on_update: F) -> SubscriptionHandle
    where
        F: FnMut(Snapshot) + Send + 'static,
    {
        let sender = self.sender(key);
        let mut rx = sender.subscribe();
        let source = self.source.clone();
        metrics::gauge!(observability::SUBSCRIPTIONS_ACTIVE).increment(1.0);
        let active = Arc::new(AtomicBool::new(true));
        let guard = GaugeGuard { active: active.clone() };

        let task = tokio::spawn(async move {
            let _guard = guard;
            if rx.borrow().is_none() {
                // cold channel: prime it with the current state. A concurrent
                // publish may beat us; the revision guard keeps the newer one.
                match source.load(&key).await {
                    Ok(snapshot) => {
                        offer(&sender, snapshot);
                    }
                    Err(e) => tracing::warn!("initial snapshot load failed for {key}: {e}"),
                }
            }
            // only receivers from here on; `remove` can close the channel
            drop(sender);
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(snapshot) = current {
                    on_update(snapshot);
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });

        SubscriptionHandle {
            task: task.abort_handle(),
            active,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
    }

    /// Drop a stream's channel, e.g. for a date that has passed. Live
    /// subscriptions on the key end once the channel closes; the next
    /// publish or subscribe starts a fresh stream.
    pub fn remove(&self, key: &StreamKey) {
        self.channels.remove(key);
    }
}
