use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::{SlotTime, TimeSlot};

/// Per-resource slot generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub open: SlotTime,
    pub close: SlotTime,
    pub slot_minutes: u32,
    pub default_capacity: u32,
}

impl SlotConfig {
    pub fn new(open: SlotTime, close: SlotTime) -> Self {
        Self {
            open,
            close,
            slot_minutes: 30,
            default_capacity: 20,
        }
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        // 09:00–17:00 in half-hour slots of 20 covers the common case;
        // anything else is configured per resource.
        Self::new(
            SlotTime::new(9, 0).expect("static time"),
            SlotTime::new(17, 0).expect("static time"),
        )
    }
}

/// Generate one empty slot per `slot_minutes` interval, starting at `open`,
/// strictly before `close`. Pure and deterministic: same inputs, same slots.
pub fn generate(
    open: SlotTime,
    close: SlotTime,
    slot_minutes: u32,
    default_capacity: u32,
) -> Result<Vec<TimeSlot>, Error> {
    if slot_minutes == 0 {
        return Err(Error::InvalidRange("slot_minutes must be positive"));
    }
    if close <= open {
        return Err(Error::InvalidRange("close must be after open"));
    }

    let mut slots = Vec::new();
    let mut t = open;
    while t < close {
        if slots.len() >= MAX_SLOTS_PER_DAY {
            return Err(Error::InvalidRange("too many slots in one day"));
        }
        slots.push(TimeSlot::new(t, default_capacity));
        match t.plus_minutes(slot_minutes) {
            Some(next) => t = next,
            None => break, // next interval would cross midnight
        }
    }
    Ok(slots)
}

pub fn generate_from(config: &SlotConfig) -> Result<Vec<TimeSlot>, Error> {
    generate(config.open, config.close, config.slot_minutes, config.default_capacity)
}
