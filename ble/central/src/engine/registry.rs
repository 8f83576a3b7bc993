//! Pending-request registry.
//!
//! Maps a request key to the ordered list of callers waiting for the one native
//! operation started for that key. An entry exists exactly while that native
//! operation is outstanding; draining removes it and hands back every waiter.

use crate::engine::timer::TimeoutTimer;
use crate::errors::CentralError;
use std::collections::HashMap;
use std::hash::Hash;

/// Completion callback of a single caller.
pub(crate) type Waiter<T> = Box<dyn FnOnce(Result<T, CentralError>) + Send + 'static>;

/// Work to run once the engine lock is released.
pub(crate) type Delivery = Box<dyn FnOnce() + Send + 'static>;

struct PendingEntry<T, M> {
    token: u64,
    meta: M,
    waiters: Vec<Waiter<T>>,
    timer: Option<TimeoutTimer>,
}

/// Waiters removed from the registry in one atomic step.
pub(crate) struct Drained<T> {
    waiters: Vec<Waiter<T>>,
}

impl<T> Drained<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve every waiter, in join order, with the same outcome.
    pub(crate) fn resolve(self, outcome: Result<T, CentralError>) {
        for waiter in self.waiters {
            waiter(outcome.clone());
        }
    }

    pub(crate) fn deferred(self, outcome: Result<T, CentralError>) -> Delivery {
        Box::new(move || self.resolve(outcome))
    }
}

/// Keyed registry of in-flight requests for one operation kind.
///
/// `M` is per-entry metadata the coordinator needs to decide whether a caller may
/// join (for example the payload of an in-flight write).
pub(crate) struct PendingRegistry<K, T, M = ()> {
    entries: HashMap<K, PendingEntry<T, M>>,
    next_token: u64,
}

impl<K, T, M> Default for PendingRegistry<K, T, M> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_token: 0,
        }
    }
}

impl<K, T, M> PendingRegistry<K, T, M>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn has_pending(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn meta(&self, key: &K) -> Option<&M> {
        self.entries.get(key).map(|entry| &entry.meta)
    }

    pub(crate) fn meta_mut(&mut self, key: &K) -> Option<&mut M> {
        self.entries.get_mut(key).map(|entry| &mut entry.meta)
    }

    /// Record a new in-flight operation for `key`.
    ///
    /// Returns the resolution token when the caller became the owner, `None` when an
    /// operation for `key` is already outstanding.
    pub(crate) fn begin_if_absent(&mut self, key: K, meta: M) -> Option<u64> {
        if self.entries.contains_key(&key) {
            return None;
        }
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        self.entries.insert(
            key,
            PendingEntry {
                token,
                meta,
                waiters: Vec::new(),
                timer: None,
            },
        );
        Some(token)
    }

    /// Append a waiter to an outstanding entry. Hands the waiter back if there is none.
    pub(crate) fn add_waiter(&mut self, key: &K, waiter: Waiter<T>) -> Result<(), Waiter<T>> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Bind a timeout timer to the entry for `key`.
    pub(crate) fn attach_timer(&mut self, key: &K, timer: TimeoutTimer) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.timer = Some(timer);
        }
    }

    /// Remove the entry for `key`, cancelling its timer.
    pub(crate) fn drain(&mut self, key: &K) -> Option<Drained<T>> {
        self.entries.remove(key).map(Self::finish)
    }

    /// Remove the entry for `key` only if it is still the one `token` was issued for.
    pub(crate) fn drain_if_current(&mut self, key: &K, token: u64) -> Option<Drained<T>> {
        let current = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.token == token);
        if current {
            self.drain(key)
        } else {
            None
        }
    }

    /// Remove every entry whose key matches `predicate`.
    pub(crate) fn drain_where<P>(&mut self, mut predicate: P) -> Vec<(K, Drained<T>)>
    where
        P: FnMut(&K) -> bool,
    {
        let keys: Vec<K> = self
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.drain(&key).map(|drained| (key, drained)))
            .collect()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<(K, Drained<T>)> {
        self.drain_where(|_| true)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn finish(entry: PendingEntry<T, M>) -> Drained<T> {
        if let Some(timer) = entry.timer {
            timer.cancel();
        }
        Drained {
            waiters: entry.waiters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_waiter(
        log: &Arc<Mutex<Vec<(usize, Result<u8, CentralError>)>>>,
        id: usize,
    ) -> Waiter<u8> {
        let log = log.clone();
        Box::new(move |outcome| log.lock().unwrap().push((id, outcome)))
    }

    #[test]
    fn second_begin_for_same_key_is_rejected() {
        let mut registry: PendingRegistry<&str, u8> = PendingRegistry::default();
        assert!(registry.begin_if_absent("battery", ()).is_some());
        assert!(registry.begin_if_absent("battery", ()).is_none());
        assert!(registry.begin_if_absent("heart-rate", ()).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn drain_notifies_in_join_order_and_removes_entry() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry: PendingRegistry<&str, u8> = PendingRegistry::default();
        registry.begin_if_absent("battery", ());
        for id in 0..3 {
            assert!(registry
                .add_waiter(&"battery", recording_waiter(&log, id))
                .is_ok());
        }

        let drained = registry.drain(&"battery").expect("entry");
        assert!(!registry.has_pending(&"battery"));
        assert_eq!(drained.len(), 3);
        drained.resolve(Ok(87));

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(0, Ok(87)), (1, Ok(87)), (2, Ok(87))]);
    }

    #[test]
    fn add_waiter_without_entry_hands_waiter_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry: PendingRegistry<&str, u8> = PendingRegistry::default();
        let waiter = registry
            .add_waiter(&"battery", recording_waiter(&log, 7))
            .err()
            .expect("no entry");
        waiter(Err(CentralError::Destroyed));
        assert_eq!(*log.lock().unwrap(), vec![(7, Err(CentralError::Destroyed))]);
    }

    #[test]
    fn stale_token_does_not_drain_newer_entry() {
        let mut registry: PendingRegistry<&str, u8> = PendingRegistry::default();
        let first = registry.begin_if_absent("battery", ()).unwrap();
        registry.drain(&"battery");
        let second = registry.begin_if_absent("battery", ()).unwrap();
        assert_ne!(first, second);

        assert!(registry.drain_if_current(&"battery", first).is_none());
        assert!(registry.has_pending(&"battery"));
        assert!(registry.drain_if_current(&"battery", second).is_some());
        assert!(!registry.has_pending(&"battery"));
    }

    #[test]
    fn drain_where_only_takes_matching_keys() {
        let mut registry: PendingRegistry<(u8, u8), u8, Vec<u8>> = PendingRegistry::default();
        registry.begin_if_absent((1, 1), vec![1]);
        registry.begin_if_absent((1, 2), vec![2]);
        registry.begin_if_absent((2, 1), vec![3]);
        assert_eq!(registry.meta(&(1, 2)), Some(&vec![2]));

        let drained = registry.drain_where(|(peripheral, _)| *peripheral == 1);
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec![&(2, 1)]);
        assert_eq!(registry.drain_all().len(), 1);
        assert_eq!(registry.len(), 0);
    }
}
