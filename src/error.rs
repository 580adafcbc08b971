use ulid::Ulid;

use crate::model::{BookingStatus, DayDate, SlotTime};
use crate::store::StoreError;

#[derive(Debug)]
pub enum Error {
    /// Malformed input; rejected synchronously, never retried.
    InvalidRequest(&'static str),
    /// Slot generation rejected the window.
    InvalidRange(&'static str),
    /// Capacity exhausted at the time of the atomic check. A normal outcome,
    /// not an exceptional one.
    SlotFull {
        resource_id: Ulid,
        date: DayDate,
        time: SlotTime,
    },
    NotFound(String),
    AlreadyCancelled(Ulid),
    InvalidTransition {
        booking_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Internal retries or the wall-clock budget were exhausted. Safe to
    /// retry with the same idempotency key.
    Timeout(&'static str),
    Store(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Error::InvalidRange(msg) => write!(f, "invalid slot range: {msg}"),
            Error::SlotFull { resource_id, date, time } => {
                write!(f, "slot full: {resource_id} {date} {time}")
            }
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::AlreadyCancelled(id) => write!(f, "booking already cancelled: {id}"),
            Error::InvalidTransition { booking_id, from, to } => {
                write!(f, "booking {booking_id}: no transition {from} -> {to}")
            }
            Error::Timeout(msg) => write!(f, "timed out: {msg}"),
            Error::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => Error::NotFound(key),
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("document decode: {e}"))
    }
}
