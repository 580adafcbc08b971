use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ulid::Ulid;

use crate::calendar::{self, SlotConfig};
use crate::error::Error;
use crate::limits::{COUNTER_BACKOFF_BASE_MS, MAX_COUNTER_ATTEMPTS};
use crate::model::{DayAvailability, DayDate, SlotTime, TimeSlot};
use crate::observability;
use crate::store::{DocumentStore, StoreError};

/// Single source of truth for per-slot capacity counters.
///
/// Each slot lives in its own document under
/// `availability/{resource}/{date}/{time}`, so a counter update touches
/// exactly one key and slots never contend with each other. Mutation is a
/// version check-and-swap against the backing store; a whole-day
/// read-modify-write is never performed (two concurrent callers could both
/// observe spare capacity and oversell).
pub struct AvailabilityStore {
    store: Arc<dyn DocumentStore>,
    configs: DashMap<Ulid, SlotConfig>,
}

fn slot_key(resource_id: Ulid, date: DayDate, time: SlotTime) -> String {
    format!("availability/{resource_id}/{date}/{time}")
}

fn day_prefix(resource_id: Ulid, date: DayDate) -> String {
    format!("availability/{resource_id}/{date}/")
}

// Revision floor for one day. Not under `day_prefix` (no trailing slash), so
// day scans never pick it up.
fn floor_key(resource_id: Ulid, date: DayDate) -> String {
    format!("availability/{resource_id}/{date}")
}

impl AvailabilityStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            configs: DashMap::new(),
        }
    }

    /// Set the slot layout used when this resource's days are generated.
    /// Already-generated days keep their slots.
    pub fn configure(&self, resource_id: Ulid, config: SlotConfig) {
        self.configs.insert(resource_id, config);
    }

    fn config_for(&self, resource_id: Ulid) -> SlotConfig {
        self.configs
            .get(&resource_id)
            .map(|e| *e.value())
            .unwrap_or_default()
    }

    /// Lazily generate the day's slots on first touch. Concurrent callers may
    /// race; put-if-absent per slot makes the race harmless.
    pub async fn ensure_day(&self, resource_id: Ulid, date: DayDate) -> Result<(), Error> {
        if !self.store.list_prefix(&day_prefix(resource_id, date)).await?.is_empty() {
            return Ok(());
        }
        let slots = calendar::generate_from(&self.config_for(resource_id))?;
        for slot in slots {
            let key = slot_key(resource_id, date, slot.time);
            match self.store.create(&key, serde_json::to_value(slot)?).await {
                Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!("generated slots for {resource_id} {date}");
        Ok(())
    }

    /// Full replace. Administrative reset only, never part of the
    /// reservation path.
    ///
    /// Deleting and rewriting slot documents can shrink the version sum, so
    /// the pre-reset revision is recorded as the day's floor; the day
    /// revision stays monotone across resets and post-reset snapshots are
    /// never mistaken for stale ones.
    pub async fn put(&self, resource_id: Ulid, date: DayDate, slots: Vec<TimeSlot>) -> Result<(), Error> {
        let floor = match self.load(resource_id, date).await {
            Ok((_, revision)) => revision,
            Err(Error::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let existing = self.store.list_prefix(&day_prefix(resource_id, date)).await?;
        let keep: Vec<String> = slots
            .iter()
            .map(|s| slot_key(resource_id, date, s.time))
            .collect();
        for (key, _) in &existing {
            if !keep.contains(key) {
                self.store.delete(key).await?;
            }
        }
        for slot in slots {
            let key = slot_key(resource_id, date, slot.time);
            self.store.put(&key, serde_json::to_value(slot)?).await?;
        }
        if floor > 0 {
            self.store
                .put(&floor_key(resource_id, date), serde_json::json!(floor))
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, resource_id: Ulid, date: DayDate) -> Result<DayAvailability, Error> {
        self.load(resource_id, date).await.map(|(day, _)| day)
    }

    /// Assemble the day plus its revision: the day's floor plus the sum of
    /// slot document versions. Versions only grow and `put` raises the floor
    /// past the old sum, so every committed update strictly increases the
    /// revision, which is the ordering token change snapshots rely on.
    pub(crate) async fn load(
        &self,
        resource_id: Ulid,
        date: DayDate,
    ) -> Result<(DayAvailability, u64), Error> {
        let docs = self.store.list_prefix(&day_prefix(resource_id, date)).await?;
        if docs.is_empty() {
            return Err(Error::NotFound(format!("availability {resource_id} {date}")));
        }
        let mut slots = BTreeMap::new();
        let mut revision: u64 = match self.store.get(&floor_key(resource_id, date)).await? {
            Some(doc) => serde_json::from_value(doc.value)?,
            None => 0,
        };
        for (_, doc) in docs {
            let slot: TimeSlot = serde_json::from_value(doc.value)?;
            revision += doc.version;
            slots.insert(slot.time, slot);
        }
        Ok((DayAvailability { resource_id, date, slots }, revision))
    }

    /// Linearizable compare-and-increment of one slot's `booked` counter.
    /// Bounded retry with geometric backoff on contention; exhaustion
    /// surfaces as `Timeout`, distinct from `SlotFull`.
    pub async fn try_reserve(&self, resource_id: Ulid, date: DayDate, time: SlotTime) -> Result<(), Error> {
        self.update_slot(resource_id, date, time, |slot| {
            if !slot.is_available() {
                metrics::counter!(observability::SLOT_FULL_TOTAL).increment(1);
                return Err(Error::SlotFull { resource_id, date, time });
            }
            slot.booked += 1;
            Ok(())
        })
        .await
    }

    /// Atomic decrement, floored at zero.
    pub async fn release(&self, resource_id: Ulid, date: DayDate, time: SlotTime) -> Result<(), Error> {
        self.update_slot(resource_id, date, time, |slot| {
            slot.booked = slot.booked.saturating_sub(1);
            Ok(())
        })
        .await
    }

    async fn update_slot<F>(
        &self,
        resource_id: Ulid,
        date: DayDate,
        time: SlotTime,
        mutate: F,
    ) -> Result<(), Error>
    where
        F: Fn(&mut TimeSlot) -> Result<(), Error>,
    {
        let key = slot_key(resource_id, date, time);
        for attempt in 0..MAX_COUNTER_ATTEMPTS {
            let doc = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("slot {resource_id} {date} {time}")))?;
            let mut slot: TimeSlot = serde_json::from_value(doc.value)?;
            mutate(&mut slot)?;
            match self
                .store
                .compare_and_put(&key, doc.version, serde_json::to_value(slot)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => {
                    metrics::counter!(observability::COUNTER_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(Duration::from_millis(COUNTER_BACKOFF_BASE_MS << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Timeout("slot counter contention"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, MemoryStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(s: &str) -> SlotTime {
        SlotTime::parse(s).unwrap()
    }

    fn date(s: &str) -> DayDate {
        DayDate::parse(s).unwrap()
    }

    fn small_config() -> SlotConfig {
        SlotConfig {
            open: t("09:00"),
            close: t("10:00"),
            slot_minutes: 30,
            default_capacity: 2,
        }
    }

    async fn store_with_day(rid: Ulid, d: DayDate) -> AvailabilityStore {
        let avail = AvailabilityStore::new(Arc::new(MemoryStore::new()));
        avail.configure(rid, small_config());
        avail.ensure_day(rid, d).await.unwrap();
        avail
    }

    #[tokio::test]
    async fn reserve_increments_booked() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("09:00")).unwrap().booked, 1);
        assert_eq!(day.slot(t("09:30")).unwrap().booked, 0);
    }

    #[tokio::test]
    async fn reserve_full_slot_is_slot_full() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        let err = avail.try_reserve(rid, d, t("09:00")).await.unwrap_err();
        assert!(matches!(err, Error::SlotFull { .. }));

        // booked never exceeds capacity
        let day = avail.get(rid, d).await.unwrap();
        let slot = day.slot(t("09:00")).unwrap();
        assert_eq!(slot.booked, slot.capacity);
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        avail.release(rid, d, t("09:00")).await.unwrap();
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("09:00")).unwrap().booked, 0);
    }

    #[tokio::test]
    async fn release_restores_capacity() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        assert!(avail.try_reserve(rid, d, t("09:00")).await.is_err());

        avail.release(rid, d, t("09:00")).await.unwrap();
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        assert!(matches!(
            avail.try_reserve(rid, d, t("09:00")).await,
            Err(Error::SlotFull { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_slot_is_not_found() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        let err = avail.try_reserve(rid, d, t("13:00")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = avail.release(Ulid::new(), d, t("09:00")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn ensure_day_is_lazy_and_idempotent() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = AvailabilityStore::new(Arc::new(MemoryStore::new()));
        avail.configure(rid, small_config());

        assert!(matches!(avail.get(rid, d).await, Err(Error::NotFound(_))));

        avail.ensure_day(rid, d).await.unwrap();
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();

        // second ensure must not reset counters
        avail.ensure_day(rid, d).await.unwrap();
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("09:00")).unwrap().booked, 1);
        assert_eq!(day.slots.len(), 2);
    }

    #[tokio::test]
    async fn put_replaces_day() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();

        avail
            .put(rid, d, vec![TimeSlot::new(t("18:00"), 10)])
            .await
            .unwrap();
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slots.len(), 1);
        assert_eq!(day.slot(t("18:00")).unwrap().booked, 0);
        assert!(day.slot(t("09:00")).is_none());
    }

    #[tokio::test]
    async fn revision_stays_monotone_across_admin_reset() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        avail.try_reserve(rid, d, t("09:30")).await.unwrap();
        let (_, before) = avail.load(rid, d).await.unwrap();

        // replacing the day with fewer, fresh documents shrinks the version
        // sum; the floor must keep the revision climbing anyway
        avail.put(rid, d, vec![TimeSlot::new(t("18:00"), 4)]).await.unwrap();
        let (_, after_reset) = avail.load(rid, d).await.unwrap();
        assert!(after_reset > before, "reset regressed: {after_reset} <= {before}");

        avail.try_reserve(rid, d, t("18:00")).await.unwrap();
        let (_, after_reserve) = avail.load(rid, d).await.unwrap();
        assert!(after_reserve > after_reset);

        // repeated resets keep climbing too
        avail.put(rid, d, vec![TimeSlot::new(t("19:00"), 1)]).await.unwrap();
        let (_, second_reset) = avail.load(rid, d).await.unwrap();
        assert!(second_reset > after_reserve);
    }

    #[tokio::test]
    async fn revision_grows_with_every_commit() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = store_with_day(rid, d).await;

        let (_, r0) = avail.load(rid, d).await.unwrap();
        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        let (_, r1) = avail.load(rid, d).await.unwrap();
        avail.release(rid, d, t("09:00")).await.unwrap();
        let (_, r2) = avail.load(rid, d).await.unwrap();
        assert!(r1 > r0);
        assert!(r2 > r1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_reserves_never_oversell() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = Arc::new(AvailabilityStore::new(Arc::new(MemoryStore::new())));
        avail.configure(
            rid,
            SlotConfig {
                open: t("12:00"),
                close: t("12:30"),
                slot_minutes: 30,
                default_capacity: 5,
            },
        );
        avail.ensure_day(rid, d).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let avail = avail.clone();
            handles.push(tokio::spawn(async move {
                avail.try_reserve(rid, d, t("12:00")).await
            }));
        }

        let mut ok = 0;
        let mut full = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(Error::SlotFull { .. }) => full += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(full, 35);

        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("12:00")).unwrap().booked, 5);
    }

    /// Store wrapper that forces the first N CAS attempts to conflict.
    struct Contentious {
        inner: MemoryStore,
        conflicts_left: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for Contentious {
        async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError> {
            self.inner.put(key, value).await
        }
        async fn create(&self, key: &str, value: Value) -> Result<u64, StoreError> {
            self.inner.create(key, value).await
        }
        async fn compare_and_put(&self, key: &str, expected: u64, value: Value) -> Result<u64, StoreError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    actual: expected + 1,
                });
            }
            self.inner.compare_and_put(key, expected, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Document)>, StoreError> {
            self.inner.list_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn transient_conflicts_are_retried() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = AvailabilityStore::new(Arc::new(Contentious {
            inner: MemoryStore::new(),
            conflicts_left: AtomicUsize::new(3),
        }));
        avail.configure(rid, small_config());
        avail.ensure_day(rid, d).await.unwrap();

        avail.try_reserve(rid, d, t("09:00")).await.unwrap();
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("09:00")).unwrap().booked, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_timeout() {
        let rid = Ulid::new();
        let d = date("2026-09-01");
        let avail = AvailabilityStore::new(Arc::new(Contentious {
            inner: MemoryStore::new(),
            conflicts_left: AtomicUsize::new(usize::MAX),
        }));
        avail.configure(rid, small_config());
        avail.ensure_day(rid, d).await.unwrap();

        let err = avail.try_reserve(rid, d, t("09:00")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // the failed operation must leave the counter untouched
        let day = avail.get(rid, d).await.unwrap();
        assert_eq!(day.slot(t("09:00")).unwrap().booked, 0);
    }
}
