//! Hard operational limits. Tuned for small deployments; raise deliberately.

/// Max attempts of the per-slot compare-and-increment before surfacing
/// a transient failure.
pub const MAX_COUNTER_ATTEMPTS: usize = 5;

/// First retry delay for counter contention; doubles per attempt.
pub const COUNTER_BACKOFF_BASE_MS: u64 = 5;

/// Wall-clock budget for a single `reserve` call.
pub const RESERVE_BUDGET_MS: u64 = 2_000;

/// Wall-clock budget for `cancel`/`confirm`/`complete`.
pub const LIFECYCLE_BUDGET_MS: u64 = 2_000;

pub const MAX_PARTY_SIZE: u32 = 64;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

pub const MAX_SPECIAL_REQUESTS_LEN: usize = 512;

/// 24h of 5-minute slots.
pub const MAX_SLOTS_PER_DAY: usize = 288;

pub const MAX_PUSH_TOKENS_PER_USER: usize = 8;
