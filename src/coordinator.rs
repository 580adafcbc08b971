use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use ulid::Ulid;

use crate::availability::AvailabilityStore;
use crate::bookings::{BookingRepository, IdempotencyBind};
use crate::dispatch::{NotificationDispatcher, PushChannel};
use crate::error::Error;
use crate::limits::{
    COUNTER_BACKOFF_BASE_MS, LIFECYCLE_BUDGET_MS, MAX_IDEMPOTENCY_KEY_LEN, MAX_PARTY_SIZE,
    MAX_SPECIAL_REQUESTS_LEN, RESERVE_BUDGET_MS,
};
use crate::model::{now_ms, Booking, BookingStatus, DayDate, NotificationKind, SlotTime};
use crate::notify::{ChangeNotifier, Snapshot, SnapshotData, SnapshotSource, StreamKey};
use crate::observability;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub date: DayDate,
    pub time: SlotTime,
    pub party_size: u32,
    /// Caller-supplied retry token: the same key always resolves to the same
    /// booking, so a timed-out call can be replayed safely.
    pub idempotency_key: String,
    pub special_requests: Option<String>,
}

/// Loads current stream state for cold subscriptions.
pub struct ReservationSnapshots {
    availability: Arc<AvailabilityStore>,
    bookings: Arc<BookingRepository>,
}

impl ReservationSnapshots {
    pub fn new(availability: Arc<AvailabilityStore>, bookings: Arc<BookingRepository>) -> Self {
        Self { availability, bookings }
    }
}

#[async_trait]
impl SnapshotSource for ReservationSnapshots {
    async fn load(&self, key: &StreamKey) -> Result<Snapshot, Error> {
        match key {
            StreamKey::ResourceDay(resource_id, date) => {
                let (day, revision) = self.availability.load(*resource_id, *date).await?;
                Ok(Snapshot {
                    revision,
                    data: SnapshotData::Availability(day),
                })
            }
            StreamKey::UserBookings(user_id) => {
                let (bookings, revision) = self.bookings.load_user(*user_id).await?;
                Ok(Snapshot {
                    revision,
                    data: SnapshotData::Bookings(bookings),
                })
            }
        }
    }
}

/// Orchestrates a booking attempt: capacity first, record second,
/// propagation last. The slot counter is authoritative: if the booking
/// record cannot be written after the counter was incremented, the increment
/// is compensated so the two can never drift.
pub struct ReservationCoordinator {
    availability: Arc<AvailabilityStore>,
    bookings: Arc<BookingRepository>,
    notifier: Arc<ChangeNotifier>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl ReservationCoordinator {
    pub fn new(
        availability: Arc<AvailabilityStore>,
        bookings: Arc<BookingRepository>,
        notifier: Arc<ChangeNotifier>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            availability,
            bookings,
            notifier,
            dispatcher,
        }
    }

    /// Wire the whole subsystem over one document store and push channel.
    pub fn bootstrap(store: Arc<dyn DocumentStore>, push: Arc<dyn PushChannel>) -> Arc<Self> {
        let availability = Arc::new(AvailabilityStore::new(store.clone()));
        let bookings = Arc::new(BookingRepository::new(store.clone()));
        let snapshots = Arc::new(ReservationSnapshots::new(availability.clone(), bookings.clone()));
        let notifier = Arc::new(ChangeNotifier::new(snapshots));
        let dispatcher = Arc::new(NotificationDispatcher::new(store, push));
        Arc::new(Self::new(availability, bookings, notifier, dispatcher))
    }

    pub fn availability(&self) -> &AvailabilityStore {
        &self.availability
    }

    pub fn bookings(&self) -> &BookingRepository {
        &self.bookings
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub async fn reserve(&self, request: ReserveRequest) -> Result<Booking, Error> {
        let start = Instant::now();
        let result = match tokio::time::timeout(
            Duration::from_millis(RESERVE_BUDGET_MS),
            self.reserve_inner(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("reserve budget exceeded")),
        };
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn reserve_inner(&self, request: ReserveRequest) -> Result<Booking, Error> {
        validate(&request)?;

        if let Some(existing) = self.bookings.by_idempotency_key(&request.idempotency_key).await? {
            tracing::debug!("idempotent replay for key {}", request.idempotency_key);
            return Ok(existing);
        }

        self.availability.ensure_day(request.resource_id, request.date).await?;
        self.availability
            .try_reserve(request.resource_id, request.date, request.time)
            .await?;

        // Capacity is held from here on; every failure path below releases it.
        let booking_id = Ulid::new();
        match self
            .bookings
            .bind_idempotency_key(&request.idempotency_key, booking_id)
            .await
        {
            Ok(IdempotencyBind::Bound) => {}
            Ok(IdempotencyBind::Existing(winner)) => {
                // a concurrent retry with the same key slipped in after our
                // lookup; yield to it
                self.release_quietly(&request).await;
                match self.bookings.get(winner).await {
                    Ok(existing) => return Ok(existing),
                    Err(Error::NotFound(_)) => {
                        // give an in-flight winner a moment to land its write
                        tokio::time::sleep(Duration::from_millis(COUNTER_BACKOFF_BASE_MS * 4)).await;
                        if let Ok(existing) = self.bookings.get(winner).await {
                            return Ok(existing);
                        }
                        // binding left by a crashed half-reservation; clear it
                        // so the caller's retry can claim the key
                        self.bookings.unbind_idempotency_key(&request.idempotency_key).await?;
                        return Err(Error::Timeout("stale idempotency binding cleared"));
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                self.release_quietly(&request).await;
                return Err(e);
            }
        }

        let now = now_ms();
        let booking = Booking {
            id: booking_id,
            resource_id: request.resource_id,
            user_id: request.user_id,
            party_size: request.party_size,
            date: request.date,
            time: request.time,
            status: BookingStatus::Pending,
            special_requests: request.special_requests.clone(),
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        };
        if let Err(e) = self.bookings.create(&booking).await {
            metrics::counter!(observability::COMPENSATIONS_TOTAL).increment(1);
            tracing::warn!("booking write failed after reserve, compensating: {e}");
            if let Err(unbind_err) = self.bookings.unbind_idempotency_key(&request.idempotency_key).await {
                tracing::error!("failed to unbind idempotency key: {unbind_err}");
            }
            self.release_quietly(&request).await;
            return Err(e);
        }

        self.publish_day(request.resource_id, request.date).await;
        self.publish_user(request.user_id).await;
        self.dispatch(request.user_id, NotificationKind::BookingCreated, &booking).await;

        tracing::info!(
            "reserved {} {} {} for {} (booking {})",
            request.resource_id,
            request.date,
            request.time,
            request.user_id,
            booking.id
        );
        Ok(booking)
    }

    pub async fn cancel(&self, booking_id: Ulid) -> Result<Booking, Error> {
        let result = match tokio::time::timeout(
            Duration::from_millis(LIFECYCLE_BUDGET_MS),
            self.cancel_inner(booking_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("cancel budget exceeded")),
        };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn cancel_inner(&self, booking_id: Ulid) -> Result<Booking, Error> {
        // The status guard commits first: of two racing cancels only one
        // passes, so the slot can never be double-released.
        let booking = self.bookings.transition(booking_id, BookingStatus::Cancelled).await?;

        if let Err(e) = self
            .availability
            .release(booking.resource_id, booking.date, booking.time)
            .await
        {
            // day was reset or never generated; the cancellation itself stands
            tracing::warn!("cancel {booking_id}: release failed: {e}");
        }

        self.publish_day(booking.resource_id, booking.date).await;
        self.publish_user(booking.user_id).await;
        self.dispatch(booking.user_id, NotificationKind::BookingCancelled, &booking).await;

        tracing::info!("cancelled booking {booking_id}");
        Ok(booking)
    }

    /// External confirmation step. Capacity-neutral.
    pub async fn confirm(&self, booking_id: Ulid) -> Result<Booking, Error> {
        self.lifecycle(booking_id, BookingStatus::Confirmed, NotificationKind::BookingConfirmed)
            .await
    }

    /// Terminal; the historical slot decrement stays.
    pub async fn complete(&self, booking_id: Ulid) -> Result<Booking, Error> {
        self.lifecycle(booking_id, BookingStatus::Completed, NotificationKind::BookingCompleted)
            .await
    }

    async fn lifecycle(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        kind: NotificationKind,
    ) -> Result<Booking, Error> {
        let booking = match tokio::time::timeout(
            Duration::from_millis(LIFECYCLE_BUDGET_MS),
            self.bookings.transition(booking_id, to),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("transition budget exceeded")),
        };
        self.publish_user(booking.user_id).await;
        self.dispatch(booking.user_id, kind, &booking).await;
        Ok(booking)
    }

    async fn release_quietly(&self, request: &ReserveRequest) {
        if let Err(e) = self
            .availability
            .release(request.resource_id, request.date, request.time)
            .await
        {
            tracing::error!(
                "compensating release failed for {} {} {}: {e}",
                request.resource_id,
                request.date,
                request.time
            );
        }
    }

    async fn publish_day(&self, resource_id: Ulid, date: DayDate) {
        match self.availability.load(resource_id, date).await {
            Ok((day, revision)) => self.notifier.publish(
                StreamKey::ResourceDay(resource_id, date),
                Snapshot {
                    revision,
                    data: SnapshotData::Availability(day),
                },
            ),
            Err(e) => tracing::warn!("availability snapshot failed for {resource_id} {date}: {e}"),
        }
    }

    async fn publish_user(&self, user_id: Ulid) {
        match self.bookings.load_user(user_id).await {
            Ok((bookings, revision)) => self.notifier.publish(
                StreamKey::UserBookings(user_id),
                Snapshot {
                    revision,
                    data: SnapshotData::Bookings(bookings),
                },
            ),
            Err(e) => tracing::warn!("bookings snapshot failed for {user_id}: {e}"),
        }
    }

    /// Notification is a secondary effect: log and move on if it fails.
    async fn dispatch(&self, user_id: Ulid, kind: NotificationKind, booking: &Booking) {
        let payload = json!({
            "booking_id": booking.id,
            "resource_id": booking.resource_id,
            "date": booking.date,
            "time": booking.time,
            "party_size": booking.party_size,
            "status": booking.status,
        });
        if let Err(e) = self.dispatcher.notify(user_id, kind, payload).await {
            tracing::warn!("notification for booking {} failed: {e}", booking.id);
        }
    }
}

fn validate(request: &ReserveRequest) -> Result<(), Error> {
    if request.party_size == 0 {
        return Err(Error::InvalidRequest("party size must be at least 1"));
    }
    if request.party_size > MAX_PARTY_SIZE {
        return Err(Error::InvalidRequest("party size too large"));
    }
    if request.idempotency_key.is_empty() {
        return Err(Error::InvalidRequest("idempotency key required"));
    }
    if request.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(Error::InvalidRequest("idempotency key too long"));
    }
    if let Some(ref s) = request.special_requests
        && s.len() > MAX_SPECIAL_REQUESTS_LEN {
            return Err(Error::InvalidRequest("special requests too long"));
        }
    Ok(())
}

fn outcome_label(result: &Result<Booking, Error>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(Error::SlotFull { .. }) => "slot_full",
        Err(Error::InvalidRequest(_)) => "invalid",
        Err(Error::AlreadyCancelled(_)) => "already_cancelled",
        Err(Error::NotFound(_)) => "not_found",
        Err(Error::Timeout(_)) => "timeout",
        Err(_) => "error",
    }
}
