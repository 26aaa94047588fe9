//! Key-set lock manager (C5 step 2 and 5).
//!
//! A method declares a static set of string keys it needs held exclusively
//! for its duration. Requests whose key-sets overlap a currently-held key
//! queue FIFO on the first conflicting key; when a key is released its
//! waiters are woken in order and the first one whose *entire* key-set is
//! now free resumes. This is what lets `B` (locking `{B}`) overtake `AB`
//! (locking `{A, B}`) when `B`'s key was never held by anything else in
//! between.

use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

pub type RequestToken = u64;

/// Outcome of requesting a key-set.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// All keys were free; they are now held by this request.
    Acquired,
    /// At least one key was held; the request was queued.
    Queued,
}

/// FIFO key-set lock table for one worker process.
///
/// Invariant (spec P3): for every key `k`, at most one in-flight request
/// holds it at a time.
#[derive(Default)]
pub struct LockTable {
    held_by: HashMap<String, RequestToken>,
    /// FIFO waiters per key, in arrival order.
    waiters: HashMap<String, VecDeque<RequestToken>>,
    /// The key-set each currently-known (held or waiting) request wants.
    wanted: HashMap<RequestToken, HashSet<String>>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire `keys` for `token`. An empty key-set always
    /// acquires immediately (spec: "An empty set means no locking").
    pub fn acquire(&mut self, token: RequestToken, keys: HashSet<String>) -> AcquireOutcome {
        self.wanted.insert(token, keys.clone());

        if keys.is_empty() || !keys.iter().any(|k| self.held_by.contains_key(k)) {
            for k in &keys {
                self.held_by.insert(k.clone(), token);
            }
            return AcquireOutcome::Acquired;
        }

        for k in &keys {
            self.waiters.entry(k.clone()).or_default().push_back(token);
        }
        AcquireOutcome::Queued
    }

    /// Release every key held by `token`, returning the tokens (in the
    /// order they should be retried) that may now be able to acquire their
    /// full key-set.
    pub fn release(&mut self, token: RequestToken) -> Vec<RequestToken> {
        let Some(keys) = self.wanted.remove(&token) else {
            return Vec::new();
        };

        let mut candidates: Vec<RequestToken> = Vec::new();
        for k in &keys {
            if self.held_by.get(k) == Some(&token) {
                self.held_by.remove(k);
            }
            if let Some(q) = self.waiters.get_mut(k) {
                q.retain(|t| t != &token);
                candidates.extend(q.iter().copied());
            }
        }

        // Preserve first-arrival order across the keys we touched, then
        // dedupe: a waiter queued on two released keys should only be
        // retried once.
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for t in candidates {
            if seen.insert(t) {
                ordered.push(t);
            }
        }

        let mut woken = Vec::new();
        for t in ordered {
            let Some(want) = self.wanted.get(&t).cloned() else { continue };
            if want.iter().all(|k| !self.held_by.contains_key(k)) {
                for k in &want {
                    self.held_by.insert(k.clone(), t);
                    if let Some(q) = self.waiters.get_mut(k) {
                        q.retain(|x| x != &t);
                    }
                }
                woken.push(t);
            }
        }
        woken
    }

    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.held_by.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> HashSet<String> {
        ks.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn disjoint_keysets_run_concurrently() {
        let mut t = LockTable::new();
        assert_eq!(t.acquire(1, keys(&["a"])), AcquireOutcome::Acquired);
        assert_eq!(t.acquire(2, keys(&["b"])), AcquireOutcome::Acquired);
    }

    #[test]
    fn overlapping_keysets_serialize() {
        let mut t = LockTable::new();
        assert_eq!(t.acquire(1, keys(&["a"])), AcquireOutcome::Acquired);
        assert_eq!(t.acquire(2, keys(&["a", "b"])), AcquireOutcome::Queued);
        let woken = t.release(1);
        assert_eq!(woken, vec![2]);
        assert!(t.is_held("a"));
        assert!(t.is_held("b"));
    }

    #[test]
    fn b_overtakes_when_b_key_free_during_ab_wait() {
        // A holds {a}. AB (wants {a,b}) queues behind A — note this only
        // *reserves a waiter slot* on b, it does not hold b. A fresh
        // request for {b} alone therefore still acquires immediately,
        // overtaking AB exactly as spec §4.5 describes.
        let mut t = LockTable::new();
        t.acquire(1, keys(&["a"]));
        assert_eq!(t.acquire(2, keys(&["a", "b"])), AcquireOutcome::Queued);
        assert_eq!(t.acquire(3, keys(&["b"])), AcquireOutcome::Acquired);
    }
}
