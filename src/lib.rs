//! Embeddable reservation subsystem: per-slot capacity counters with
//! compare-and-increment semantics, an idempotent booking lifecycle, and
//! last-wins change streams that fan out fresh state snapshots to
//! subscribers. Everything persists through one versioned document store.

pub mod availability;
pub mod bookings;
pub mod calendar;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;

pub use availability::AvailabilityStore;
pub use bookings::{BookingRepository, IdempotencyBind};
pub use calendar::SlotConfig;
pub use coordinator::{ReservationCoordinator, ReservationSnapshots, ReserveRequest};
pub use dispatch::{NotificationDispatcher, PushChannel, PushError};
pub use error::Error;
pub use model::{
    Booking, BookingStatus, DayAvailability, DayDate, Notification, NotificationKind, SlotTime,
    TimeSlot,
};
pub use notify::{ChangeNotifier, Snapshot, SnapshotData, SnapshotSource, StreamKey, SubscriptionHandle};
pub use store::{Document, DocumentStore, MemoryStore, StoreError};
