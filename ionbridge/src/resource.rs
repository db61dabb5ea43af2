//! ID-addressable resource tables.
//!
//! Every live handle in the core — file descriptors, directory readers,
//! sockets, servers, peers — is owned by exactly one [`Table`], keyed by its
//! 64-bit id. External code holds only ids; a lookup hands a closure
//! temporary access under the table lock, and nothing that borrows the entry
//! survives the lock release. Resources are removed only from the reactor
//! thread.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::id::Id;

/// Bookkeeping wrapped around every stored resource.
struct Entry<R> {
    resource: R,
    #[allow(dead_code)]
    created_at: Instant,
    last_used: Instant,
    retained: bool,
}

/// A mutex-serialized map of `Id → R`.
///
/// One instance per owning service; the lock is held only across map edits
/// and the caller's closure, never across I/O or user callbacks.
pub struct Table<R> {
    entries: Mutex<HashMap<Id, Entry<R>>>,
}

impl<R> Table<R> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a resource under `id`, replacing any previous occupant.
    pub fn insert(&self, id: Id, resource: R) {
        let now = Instant::now();
        self.entries.lock().unwrap().insert(
            id,
            Entry {
                resource,
                created_at: now,
                last_used: now,
                retained: false,
            },
        );
    }

    /// Removes and returns the resource under `id`.
    pub fn remove(&self, id: Id) -> Option<R> {
        self.entries
            .lock()
            .unwrap()
            .remove(&id)
            .map(|entry| entry.resource)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Runs `f` against the resource under the table lock, refreshing its
    /// last-used timestamp. Returns `None` if the id is unknown.
    pub fn with<T>(&self, id: Id, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&id).map(|entry| {
            entry.last_used = Instant::now();
            f(&mut entry.resource)
        })
    }

    /// Like [`with`](Table::with) for callers that only mutate. Returns
    /// whether the id was known.
    pub fn update(&self, id: Id, f: impl FnOnce(&mut R)) -> bool {
        self.with(id, f).is_some()
    }

    /// Refreshes the last-used timestamp without touching the resource.
    pub fn touch(&self, id: Id) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.last_used = Instant::now();
        }
    }

    /// Marks the resource exempt from (or eligible for) staleness reclaim.
    ///
    /// Returns false if the id is unknown.
    pub fn set_retained(&self, id: Id, retained: bool) -> bool {
        match self.entries.lock().unwrap().get_mut(&id) {
            Some(entry) => {
                entry.retained = retained;
                true
            }
            None => false,
        }
    }

    /// All ids currently present, in no particular order.
    pub fn ids(&self) -> Vec<Id> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    /// How long the resource has been idle, without refreshing it.
    pub fn idle_for(&self, id: Id) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .map(|entry| entry.last_used.elapsed())
    }

    /// Ids of unretained resources idle longer than `threshold`.
    ///
    /// Used by the descriptor cleanup ledger; the caller closes each id
    /// through the owning service so teardown happens on the reactor thread.
    pub fn stale_ids(&self, threshold: Duration) -> Vec<Id> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| !entry.retained && entry.last_used.elapsed() > threshold)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self::new()
    }
}
