use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Unix milliseconds, the only timestamp type.
pub type Ms = i64;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Wall-clock minute of day, rendered as `HH:MM`. Slot labels sort
/// chronologically because the underlying representation is minutes
/// since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SlotTime(u16);

impl SlotTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour as u16 * 60 + minute as u16))
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.split_once(':')?;
        if h.len() != 2 || m.len() != 2 {
            return None;
        }
        Self::new(h.parse().ok()?, m.parse().ok()?)
    }

    pub fn minute_of_day(&self) -> u16 {
        self.0
    }

    /// Advance by `minutes`. `None` once midnight is passed.
    pub fn plus_minutes(&self, minutes: u32) -> Option<Self> {
        let total = self.0 as u32 + minutes;
        if total < 24 * 60 {
            Some(Self(total as u16))
        } else {
            None
        }
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl From<SlotTime> for String {
    fn from(t: SlotTime) -> String {
        t.to_string()
    }
}

impl TryFrom<String> for SlotTime {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        SlotTime::parse(&s).ok_or_else(|| format!("invalid time label: {s}"))
    }
}

/// Calendar date, rendered as `YYYY-MM-DD`. Field order gives chronological
/// `Ord` for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DayDate {
    year: u16,
    month: u8,
    day: u8,
}

impl DayDate {
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        if month == 0 || month > 12 || day == 0 || day > days_in_month(year, month) {
            return None;
        }
        Some(Self { year, month, day })
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('-');
        let y = parts.next()?;
        let m = parts.next()?;
        let d = parts.next()?;
        if parts.next().is_some() || y.len() != 4 || m.len() != 2 || d.len() != 2 {
            return None;
        }
        Self::new(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
    }
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
            if leap { 29 } else { 28 }
        }
        _ => 0,
    }
}

impl fmt::Display for DayDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl From<DayDate> for String {
    fn from(d: DayDate) -> String {
        d.to_string()
    }
}

impl TryFrom<String> for DayDate {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        DayDate::parse(&s).ok_or_else(|| format!("invalid date: {s}"))
    }
}

/// One bookable interval of a resource's day.
/// Invariant: `booked <= capacity` at all times, under all concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub time: SlotTime,
    pub capacity: u32,
    pub booked: u32,
}

impl TimeSlot {
    pub fn new(time: SlotTime, capacity: u32) -> Self {
        Self { time, capacity, booked: 0 }
    }

    pub fn is_available(&self) -> bool {
        self.booked < self.capacity
    }
}

/// All slots of one (resource, date). Assembled from per-slot documents;
/// `BTreeMap` keyed by `SlotTime` gives chronological enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub resource_id: Ulid,
    pub date: DayDate,
    pub slots: BTreeMap<SlotTime, TimeSlot>,
}

impl DayAvailability {
    pub fn slot(&self, time: SlotTime) -> Option<&TimeSlot> {
        self.slots.get(&time)
    }
}

/// Booking lifecycle. A booking owns one unit of slot capacity while
/// `Pending` or `Confirmed`; `Cancelled` releases it; `Completed` keeps the
/// historical decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub party_size: u32,
    pub date: DayDate,
    pub time: SlotTime,
    pub status: BookingStatus,
    pub special_requests: Option<String>,
    pub idempotency_key: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    /// Sort key for `by_user` listings (most recent slot first).
    pub fn date_time(&self) -> (DayDate, SlotTime) {
        (self.date, self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    BookingConfirmed,
    BookingCancelled,
    BookingCompleted,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "Booking received",
            NotificationKind::BookingConfirmed => "Booking confirmed",
            NotificationKind::BookingCancelled => "Booking cancelled",
            NotificationKind::BookingCompleted => "Thanks for visiting",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "Your booking request was received and is pending.",
            NotificationKind::BookingConfirmed => "Your booking has been confirmed.",
            NotificationKind::BookingCancelled => "Your booking has been cancelled.",
            NotificationKind::BookingCompleted => "Your booking is complete. See you again soon.",
        }
    }
}

/// Persisted per-user notification. Immutable after creation except for the
/// `read` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub read: bool,
    pub created_at: Ms,
    pub data: Option<Value>,
}
