use std::sync::Arc;

use serde_json::json;
use ulid::Ulid;

use crate::error::Error;
use crate::limits::{MAX_COUNTER_ATTEMPTS, MAX_PARTY_SIZE, MAX_SPECIAL_REQUESTS_LEN};
use crate::model::{now_ms, Booking, BookingStatus, DayDate};
use crate::store::{DocumentStore, StoreError};

/// Outcome of binding an idempotency key to a booking.
#[derive(Debug, PartialEq, Eq)]
pub enum IdempotencyBind {
    /// This booking now owns the key.
    Bound,
    /// Another booking won the key first.
    Existing(Ulid),
}

/// CRUD and lifecycle transitions for bookings. Deliberately knows nothing
/// about slot counters: a booking record explains *why* a capacity unit is
/// held, the availability store decides *whether* one can be.
pub struct BookingRepository {
    store: Arc<dyn DocumentStore>,
}

fn booking_key(id: Ulid) -> String {
    format!("booking/{id}")
}

fn idempotency_key(key: &str) -> String {
    format!("idempotency/{key}")
}

impl BookingRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, booking: &Booking) -> Result<(), Error> {
        self.store
            .create(&booking_key(booking.id), serde_json::to_value(booking)?)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Ulid) -> Result<Booking, Error> {
        let doc = self
            .store
            .get(&booking_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("booking {id}")))?;
        Ok(serde_json::from_value(doc.value)?)
    }

    /// Claim `key` for `booking_id`. Put-if-absent on the key document makes
    /// exactly one booking win; losers learn the winner's id.
    pub async fn bind_idempotency_key(&self, key: &str, booking_id: Ulid) -> Result<IdempotencyBind, Error> {
        let doc_key = idempotency_key(key);
        match self.store.create(&doc_key, json!({ "booking_id": booking_id })).await {
            Ok(_) => Ok(IdempotencyBind::Bound),
            Err(StoreError::AlreadyExists(_)) => {
                let doc = self
                    .store
                    .get(&doc_key)
                    .await?
                    .ok_or_else(|| Error::Store(format!("idempotency binding vanished: {key}")))?;
                let id: Ulid = serde_json::from_value(doc.value["booking_id"].clone())?;
                Ok(IdempotencyBind::Existing(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a binding written by a reservation that later failed and was
    /// compensated.
    pub async fn unbind_idempotency_key(&self, key: &str) -> Result<(), Error> {
        self.store.delete(&idempotency_key(key)).await?;
        Ok(())
    }

    pub async fn by_idempotency_key(&self, key: &str) -> Result<Option<Booking>, Error> {
        let Some(doc) = self.store.get(&idempotency_key(key)).await? else {
            return Ok(None);
        };
        let id: Ulid = serde_json::from_value(doc.value["booking_id"].clone())?;
        match self.get(id).await {
            Ok(booking) => Ok(Some(booking)),
            // binding left behind by a crashed half-reservation
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All bookings of one user, most recent slot first.
    pub async fn by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, Error> {
        self.load_user(user_id).await.map(|(bookings, _)| bookings)
    }

    /// `by_user` plus the stream revision (sum of document versions; bookings
    /// are never deleted in the hot path, so the sum is monotone).
    pub(crate) async fn load_user(&self, user_id: Ulid) -> Result<(Vec<Booking>, u64), Error> {
        let mut bookings = Vec::new();
        let mut revision = 0u64;
        for (_, doc) in self.store.list_prefix("booking/").await? {
            let booking: Booking = serde_json::from_value(doc.value)?;
            if booking.user_id == user_id {
                revision += doc.version;
                bookings.push(booking);
            }
        }
        bookings.sort_by(|a, b| b.date_time().cmp(&a.date_time()).then(b.created_at.cmp(&a.created_at)));
        Ok((bookings, revision))
    }

    /// All bookings for one resource on one date, chronological.
    pub async fn by_resource_and_date(&self, resource_id: Ulid, date: DayDate) -> Result<Vec<Booking>, Error> {
        let mut bookings: Vec<Booking> = Vec::new();
        for (_, doc) in self.store.list_prefix("booking/").await? {
            let booking: Booking = serde_json::from_value(doc.value)?;
            if booking.resource_id == resource_id && booking.date == date {
                bookings.push(booking);
            }
        }
        bookings.sort_by_key(|b| (b.time, b.created_at));
        Ok(bookings)
    }

    /// Status-guarded transition. The guard and the write are one CAS unit:
    /// two racing transitions on the same booking cannot both pass the guard
    /// and commit.
    pub async fn transition(&self, id: Ulid, to: BookingStatus) -> Result<Booking, Error> {
        let key = booking_key(id);
        for _ in 0..MAX_COUNTER_ATTEMPTS {
            let doc = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("booking {id}")))?;
            let mut booking: Booking = serde_json::from_value(doc.value)?;

            if to == BookingStatus::Cancelled && booking.status == BookingStatus::Cancelled {
                return Err(Error::AlreadyCancelled(id));
            }
            if !booking.status.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    booking_id: id,
                    from: booking.status,
                    to,
                });
            }

            booking.status = to;
            booking.updated_at = now_ms();
            if to == BookingStatus::Cancelled {
                booking.cancelled_at = Some(booking.updated_at);
            }

            match self
                .store
                .compare_and_put(&key, doc.version, serde_json::to_value(&booking)?)
                .await
            {
                Ok(_) => return Ok(booking),
                Err(StoreError::VersionConflict { .. }) => continue, // re-read, re-guard
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Timeout("booking transition contention"))
    }

    /// Partial update of caller-editable fields. Never touches status or
    /// capacity.
    pub async fn update_details(
        &self,
        id: Ulid,
        party_size: Option<u32>,
        special_requests: Option<String>,
    ) -> Result<Booking, Error> {
        if let Some(n) = party_size
            && (n == 0 || n > MAX_PARTY_SIZE) {
                return Err(Error::InvalidRequest("party size out of range"));
            }
        if let Some(ref s) = special_requests
            && s.len() > MAX_SPECIAL_REQUESTS_LEN {
                return Err(Error::InvalidRequest("special requests too long"));
            }

        let key = booking_key(id);
        for _ in 0..MAX_COUNTER_ATTEMPTS {
            let doc = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("booking {id}")))?;
            let mut booking: Booking = serde_json::from_value(doc.value)?;
            if let Some(n) = party_size {
                booking.party_size = n;
            }
            if let Some(ref s) = special_requests {
                booking.special_requests = Some(s.clone());
            }
            booking.updated_at = now_ms();

            match self
                .store
                .compare_and_put(&key, doc.version, serde_json::to_value(&booking)?)
                .await
            {
                Ok(_) => return Ok(booking),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Timeout("booking update contention"))
    }
}
