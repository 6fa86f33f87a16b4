//! Ordered map from numeric IDs to reference-counted entries.
//!
//! Entries live in a slot array. A handle names its entry by `(slot, generation)`, so releasing a
//! handle always finds the entry it was taken from, even after that entry was removed and its
//! numeric ID handed to a new registration. Removing a referenced entry only unlinks it from the
//! active table and parks its slot in the pending-deletion set; the slot is freed (and its
//! generation bumped) when the last handle goes away.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, Deref};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, warn};

use common::constants::REFCOUNT_WARN_THRESHOLD;

pub struct ReferencedEntryMap<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ReferencedEntryMap<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    label: String,
    state: Mutex<MapState<T>>,
    first_entry: Condvar,
}

struct MapState<T> {
    slots: Vec<Slot<T>>,
    free_slots: Vec<usize>,
    active: BTreeMap<u16, usize>,
    pending_deletion: BTreeSet<usize>,
    interrupted: bool,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Entry<T>>,
}

struct Entry<T> {
    key: u16,
    value: Arc<T>,
    refs: usize,
}

/// Where the entry behind a handle currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLocation {
    Active,
    PendingDeletion,
    Gone,
}

/// Result of comparing the active keys with an authoritative sorted key list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDiff {
    pub added: Vec<u16>,
    pub removed: Vec<u16>,
    pub unchanged: Vec<u16>,
}

/// A counted reference to one entry. Dropping it releases the reference.
pub struct EntryRef<T> {
    shared: Arc<Shared<T>>,
    slot: usize,
    generation: u64,
    key: u16,
    value: Arc<T>,
    released: bool,
}

impl<T> MapState<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            active: BTreeMap::new(),
            pending_deletion: BTreeSet::new(),
            interrupted: false,
        }
    }

    fn allocate(&mut self, key: u16, value: T) -> usize {
        let entry = Entry {
            key,
            value: Arc::new(value),
            refs: 0,
        };

        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot].entry = Some(entry);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.slots.len() - 1
            }
        }
    }

    fn free(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.entry = None;
        s.generation += 1;
        self.free_slots.push(slot);
    }

    fn live_entry_mut(&mut self, slot: usize, generation: u64) -> Option<&mut Entry<T>> {
        self.slots
            .get_mut(slot)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.entry.as_mut())
    }

    /// Takes one more reference on an active slot.
    fn acquire(&mut self, slot: usize, label: &str) -> Option<(u64, u16, Arc<T>)> {
        let s = self.slots.get_mut(slot)?;
        let generation = s.generation;
        let Some(entry) = s.entry.as_mut() else {
            error!(store = label, slot, "bug: active table points at an empty slot");
            return None;
        };
        entry.add_ref(label);

        Some((generation, entry.key, Arc::clone(&entry.value)))
    }
}

impl<T> Entry<T> {
    fn add_ref(&mut self, label: &str) {
        self.refs += 1;

        if self.refs > REFCOUNT_WARN_THRESHOLD {
            warn!(
                store = label,
                num_id = self.key,
                refs = self.refs,
                "lots of references to node (leak?)"
            );
        }
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, MapState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn make_ref(self: &Arc<Self>, state: &mut MapState<T>, slot: usize) -> Option<EntryRef<T>> {
        let (generation, key, value) = state.acquire(slot, &self.label)?;
        Some(EntryRef {
            shared: Arc::clone(self),
            slot,
            generation,
            key,
            value,
            released: false,
        })
    }

    /// Returns true if this release destroyed the entry.
    fn release(&self, slot: usize, generation: u64) -> bool {
        let mut state = self.lock();

        // Pending deletion is keyed by slot identity and must be checked before the active table:
        // the numeric ID of a removed entry may already belong to a fresh registration.
        if state.pending_deletion.contains(&slot) {
            let Some(entry) = state.live_entry_mut(slot, generation) else {
                error!(store = %self.label, slot, "bug: stale handle for an entry pending deletion");
                return false;
            };

            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return false;
            }

            state.pending_deletion.remove(&slot);
            state.free(slot);
            return true;
        }

        let Some(entry) = state.live_entry_mut(slot, generation) else {
            error!(store = %self.label, slot, generation, "bug: release of a stale handle");
            return false;
        };
        let key = entry.key;

        if state.active.get(&key) != Some(&slot) {
            error!(
                store = %self.label,
                num_id = key,
                "bug: released entry is neither active nor pending deletion"
            );
            return false;
        }

        if let Some(entry) = state.live_entry_mut(slot, generation) {
            if entry.refs == 0 {
                error!(store = %self.label, num_id = key, "bug: refusing to release an entry with zero references");
            } else {
                entry.refs -= 1;
            }
        }

        false
    }
}

impl<T> ReferencedEntryMap<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state: Mutex::new(MapState::new()),
                first_entry: Condvar::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Inserts `value` under `key` unless an active entry exists; in that case `update` is called
    /// with the existing value and the discarded incoming one. Returns true for a new entry.
    pub fn add_or_update<F>(&self, key: u16, value: T, update: F) -> bool
    where
        F: FnOnce(&T, T),
    {
        let mut state = self.shared.lock();

        if let Some(&slot) = state.active.get(&key) {
            if let Some(entry) = state.slots[slot].entry.as_ref() {
                let existing = Arc::clone(&entry.value);
                update(&existing, value);
            }
            return false;
        }

        let slot = state.allocate(key, value);
        state.active.insert(key, slot);
        drop(state);

        self.shared.first_entry.notify_all();
        true
    }

    pub fn reference(&self, key: u16) -> Option<EntryRef<T>> {
        let mut state = self.shared.lock();
        let slot = *state.active.get(&key)?;
        self.shared.make_ref(&mut state, slot)
    }

    /// Same as dropping the handle; returns true if this was the last reference to an entry
    /// that had already been removed.
    pub fn release(&self, handle: EntryRef<T>) -> bool {
        handle.release()
    }

    /// Unlinks `key` from the active table. Returns true if it was active.
    pub fn remove(&self, key: u16) -> bool {
        let mut state = self.shared.lock();

        let Some(slot) = state.active.remove(&key) else {
            return false;
        };

        let referenced = state.slots[slot]
            .entry
            .as_ref()
            .is_some_and(|entry| entry.refs > 0);

        if referenced {
            state.pending_deletion.insert(slot);
        } else {
            state.free(slot);
        }

        true
    }

    pub fn reference_first(&self) -> Option<EntryRef<T>> {
        let mut state = self.shared.lock();
        let slot = *state.active.values().next()?;
        self.shared.make_ref(&mut state, slot)
    }

    /// References the entry with the smallest key greater than `prev_key`. `prev_key` need not
    /// be present any more, so iteration survives a concurrent removal of the previous entry.
    pub fn reference_next(&self, prev_key: u16) -> Option<EntryRef<T>> {
        let mut state = self.shared.lock();
        let (_, &slot) = state
            .active
            .range((Bound::Excluded(prev_key), Bound::Unbounded))
            .next()?;
        self.shared.make_ref(&mut state, slot)
    }

    pub fn reference_nth(&self, n: usize) -> Option<EntryRef<T>> {
        let mut state = self.shared.lock();
        let slot = *state.active.values().nth(n)?;
        self.shared.make_ref(&mut state, slot)
    }

    pub fn reference_all(&self) -> Vec<EntryRef<T>> {
        let mut state = self.shared.lock();
        let slots: Vec<usize> = state.active.values().copied().collect();
        slots
            .into_iter()
            .filter_map(|slot| self.shared.make_ref(&mut state, slot))
            .collect()
    }

    /// Iterates over a snapshot of the keys taken now, re-resolving each key when reached.
    pub fn cursor(&self) -> EntryCursor<T> {
        EntryCursor {
            map: self.clone(),
            keys: self.keys().into_iter(),
        }
    }

    pub fn keys(&self) -> Vec<u16> {
        self.shared.lock().active.keys().copied().collect()
    }

    pub fn contains(&self, key: u16) -> bool {
        self.shared.lock().active.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_deletion_len(&self) -> usize {
        self.shared.lock().pending_deletion.len()
    }

    /// Outstanding references on the active entry for `key`.
    pub fn ref_count(&self, key: u16) -> Option<usize> {
        let state = self.shared.lock();
        let slot = *state.active.get(&key)?;
        state.slots[slot].entry.as_ref().map(|entry| entry.refs)
    }

    pub fn location(&self, handle: &EntryRef<T>) -> EntryLocation {
        let state = self.shared.lock();

        let live = state
            .slots
            .get(handle.slot)
            .is_some_and(|s| s.generation == handle.generation && s.entry.is_some());
        if !live {
            return EntryLocation::Gone;
        }

        let in_active = state.active.get(&handle.key) == Some(&handle.slot);
        let in_pending = state.pending_deletion.contains(&handle.slot);

        match (in_active, in_pending) {
            (true, false) => EntryLocation::Active,
            (false, true) => EntryLocation::PendingDeletion,
            (true, true) => {
                error!(store = %self.shared.label, num_id = handle.key, "bug: entry is both active and pending deletion");
                EntryLocation::Active
            }
            (false, false) => EntryLocation::Gone,
        }
    }

    /// Sorted merge of the active keys against `sorted_master` (ascending, no duplicates),
    /// computed under the map lock.
    pub fn diff_keys(&self, sorted_master: &[u16]) -> KeyDiff {
        let state = self.shared.lock();

        let mut diff = KeyDiff::default();
        let mut active = state.active.keys().copied().peekable();
        let mut master = sorted_master.iter().copied().peekable();

        loop {
            match (active.peek().copied(), master.peek().copied()) {
                (Some(a), Some(m)) if m < a => {
                    diff.added.push(m);
                    master.next();
                }
                (Some(a), Some(m)) if a < m => {
                    diff.removed.push(a);
                    active.next();
                }
                (Some(a), Some(_)) => {
                    diff.unchanged.push(a);
                    active.next();
                    master.next();
                }
                (Some(a), None) => {
                    diff.removed.push(a);
                    active.next();
                }
                (None, Some(m)) => {
                    diff.added.push(m);
                    master.next();
                }
                (None, None) => break,
            }
        }

        diff
    }

    /// Blocks until at least one entry is active, the timeout elapses, or waiters are
    /// interrupted. Returns whether an entry exists.
    pub fn wait_for_first(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .first_entry
            .wait_timeout_while(state, timeout, |s| s.active.is_empty() && !s.interrupted)
            .unwrap_or_else(PoisonError::into_inner);

        !state.active.is_empty()
    }

    /// Wakes every `wait_for_first` caller and makes later calls return immediately.
    pub fn interrupt_waiters(&self) {
        self.shared.lock().interrupted = true;
        self.shared.first_entry.notify_all();
    }
}

impl<T> EntryRef<T> {
    pub fn key(&self) -> u16 {
        self.key
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Releases the reference now. Returns true if this destroyed an entry pending deletion.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.shared.release(self.slot, self.generation)
    }
}

impl<T> Deref for EntryRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for EntryRef<T> {
    fn clone(&self) -> Self {
        let mut state = self.shared.lock();
        let acquired = match state.live_entry_mut(self.slot, self.generation) {
            Some(entry) => {
                entry.add_ref(&self.shared.label);
                true
            }
            None => {
                error!(store = %self.shared.label, num_id = self.key, "bug: cloning a stale handle");
                false
            }
        };

        EntryRef {
            shared: Arc::clone(&self.shared),
            slot: self.slot,
            generation: self.generation,
            key: self.key,
            value: Arc::clone(&self.value),
            released: !acquired,
        }
    }
}

impl<T> Drop for EntryRef<T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.slot, self.generation);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EntryRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("value", &self.value)
            .finish()
    }
}

pub enum CursorItem<T> {
    Active(EntryRef<T>),
    /// The key was part of the snapshot but is no longer active.
    Removed(u16),
}

pub struct EntryCursor<T> {
    map: ReferencedEntryMap<T>,
    keys: std::vec::IntoIter<u16>,
}

impl<T> Iterator for EntryCursor<T> {
    type Item = CursorItem<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.next()?;
        Some(match self.map.reference(key) {
            Some(entry) => CursorItem::Active(entry),
            None => CursorItem::Removed(key),
        })
    }
}
