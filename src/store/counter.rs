//! Capacity-bounded counter store shared by every worker.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

/// Upper bound on slots allocated up front; larger stores grow on demand.
const PREALLOCATED_SLOTS: usize = 1024;

/// Identifies the partition a policy enforces limits against.
///
/// A client address, a fixed sentinel for service-wide caps, or an
/// application-defined identifier such as an API key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Create a new scope key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ScopeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for ScopeKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record matched the expected value and was replaced.
    Applied,
    /// Another writer changed (or removed) the record since it was read.
    Conflict,
    /// The key is new and the store has no free slot for it.
    Full,
}

/// A fixed-capacity map from [`ScopeKey`] to a small `Copy` record.
///
/// Every mutation is linearizable per key: the map is split into shards,
/// each guarded by its own lock, and a conditional write compares and
/// replaces the record while holding that shard. Inserting a new key
/// claims one of `capacity` slots up front; when none is free the insert
/// is refused and the caller treats the key as unseen. No entry is ever
/// evicted to make room.
///
/// The store also carries one aggregate counter that is independent of
/// the per-key records.
#[derive(Debug)]
pub struct SharedCounterStore<R> {
    records: DashMap<ScopeKey, R>,
    capacity: usize,
    live: AtomicUsize,
    total: AtomicU32,
}

impl<R> SharedCounterStore<R>
where
    R: Copy + PartialEq,
{
    /// Create a store that tracks at most `capacity` distinct keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: DashMap::with_capacity(capacity.min(PREALLOCATED_SLOTS)),
            capacity,
            live: AtomicUsize::new(0),
            total: AtomicU32::new(0),
        }
    }

    /// Read the record for `key` without side effects.
    pub fn get(&self, key: &str) -> Option<R> {
        self.records.get(key).map(|record| *record)
    }

    /// Replace the record for `key` with `new` if it still equals `expected`.
    ///
    /// `expected == None` means the caller observed no record; the write
    /// then succeeds only if the key is still absent and a slot is free.
    pub fn compare_and_set(&self, key: &str, expected: Option<R>, new: R) -> CasOutcome {
        // Fast path: existing key, no key allocation.
        if let Some(mut current) = self.records.get_mut(key) {
            if Some(*current) != expected {
                return CasOutcome::Conflict;
            }
            *current = new;
            return CasOutcome::Applied;
        }

        match self.records.entry(ScopeKey::from(key)) {
            Entry::Occupied(mut occupied) => {
                if Some(*occupied.get()) != expected {
                    return CasOutcome::Conflict;
                }
                occupied.insert(new);
                CasOutcome::Applied
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return CasOutcome::Conflict;
                }
                if !self.reserve_slot() {
                    trace!(key = %key, capacity = self.capacity, "Counter store full");
                    return CasOutcome::Full;
                }
                vacant.insert(new);
                CasOutcome::Applied
            }
        }
    }

    /// Write `new` for `key` unconditionally.
    ///
    /// Returns `false` only when `key` is new and the store is full.
    pub fn upsert(&self, key: &str, new: R) -> bool {
        if let Some(mut current) = self.records.get_mut(key) {
            *current = new;
            return true;
        }

        match self.records.entry(ScopeKey::from(key)) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(new);
                true
            }
            Entry::Vacant(vacant) => {
                if !self.reserve_slot() {
                    return false;
                }
                vacant.insert(new);
                true
            }
        }
    }

    /// Remove the record for `key`, freeing its slot.
    pub fn delete(&self, key: &str) -> Option<R> {
        let removed = self.records.remove(key).map(|(_, record)| record);
        if removed.is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove the record for `key` only if it still equals `expected`.
    pub fn compare_and_delete(&self, key: &str, expected: R) -> bool {
        let removed = self
            .records
            .remove_if(key, |_, current| *current == expected)
            .is_some();
        if removed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Increment the aggregate counter, returning the new value.
    pub fn increment_total(&self) -> u32 {
        let previous = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_add(1)))
            .unwrap_or_else(|t| t);
        previous.saturating_add(1)
    }

    /// Increment the aggregate counter only while it is below `max`.
    ///
    /// Returns the new value, or `None` if the counter was already at `max`.
    pub fn try_increment_total(&self, max: u32) -> Option<u32> {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                (t < max).then(|| t + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Decrement the aggregate counter, saturating at zero.
    pub fn decrement_total(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_sub(1)));
    }

    /// Current value of the aggregate counter.
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of distinct keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve_slot(&self) -> bool {
        let capacity = self.capacity;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < capacity).then(|| live + 1)
            })
            .is_ok()
    }
}
