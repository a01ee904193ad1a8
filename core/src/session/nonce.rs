// Nonce tracking — per-session request counter and replay guard
//
// Clients stamp every envelope with `NonceCounter::next()`. Routers keep a
// `ReplayGuard` per session and accept only nonces strictly greater than
// the last accepted one. A rejected nonce leaves the guard untouched.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Replayed or stale nonce {nonce} (last accepted {last})")]
    Stale { nonce: u64, last: u64 },
}

/// Lock-free monotonically increasing request counter
#[derive(Debug, Default)]
pub struct NonceCounter {
    value: AtomicU64,
}

impl NonceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Counter resumed from a previous session.
    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Value for the next request. The first call on a fresh counter returns 0.
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst)
    }

    /// Value the next call to `next()` will return.
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Resynchronize after a session resume.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }
}

/// Strictly-increasing nonce check for one session
#[derive(Debug, Default)]
pub struct ReplayGuard {
    last: Mutex<Option<u64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `nonce` if it is greater than every previously accepted nonce.
    pub fn accept(&self, nonce: u64) -> Result<(), ReplayError> {
        self.accept_with(nonce, || Ok::<_, ReplayError>(()))
    }

    /// Accept `nonce` and run `commit` while holding the guard. The nonce is
    /// only recorded when `commit` succeeds, and requests on the same
    /// session cannot interleave with it.
    pub fn accept_with<T, E>(
        &self,
        nonce: u64,
        commit: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ReplayError>,
    {
        let mut last = self.last.lock();
        if let Some(previous) = *last {
            if nonce <= previous {
                return Err(ReplayError::Stale {
                    nonce,
                    last: previous,
                }
                .into());
            }
        }
        let value = commit()?;
        *last = Some(nonce);
        Ok(value)
    }

    /// Session resume: `nonce` becomes the last accepted value, so any
    /// request stamped at or before it is rejected from now on.
    pub fn resync(&self, nonce: u64) {
        *self.last.lock() = Some(nonce);
    }

    pub fn last_accepted(&self) -> Option<u64> {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_sequence() {
        let counter = NonceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.peek(), 3);
    }

    #[test]
    fn test_counter_resume_and_set() {
        let counter = NonceCounter::starting_at(41);
        assert_eq!(counter.next(), 41);
        counter.set(100);
        assert_eq!(counter.next(), 100);
    }

    #[test]
    fn test_counter_concurrent_values_unique() {
        let counter = Arc::new(NonceCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..250).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all[999], 999);
    }

    #[test]
    fn test_first_nonce_may_be_zero() {
        let guard = ReplayGuard::new();
        assert_eq!(guard.last_accepted(), None);
        guard.accept(0).unwrap();
        assert_eq!(guard.last_accepted(), Some(0));
    }

    #[test]
    fn test_replay_rejected_without_mutation() {
        let guard = ReplayGuard::new();
        guard.accept(5).unwrap();

        assert_eq!(guard.accept(5), Err(ReplayError::Stale { nonce: 5, last: 5 }));
        assert_eq!(guard.accept(3), Err(ReplayError::Stale { nonce: 3, last: 5 }));
        assert_eq!(guard.last_accepted(), Some(5));

        guard.accept(6).unwrap();
        assert_eq!(guard.last_accepted(), Some(6));
    }

    #[test]
    fn test_failed_commit_keeps_nonce_usable() {
        let guard = ReplayGuard::new();
        guard.accept(1).unwrap();

        let failed: Result<(), ReplayError> =
            guard.accept_with(2, || Err(ReplayError::Stale { nonce: 0, last: 0 }));
        assert!(failed.is_err());
        assert_eq!(guard.last_accepted(), Some(1));

        let stale: Result<u8, ReplayError> = guard.accept_with(1, || Ok(9));
        assert_eq!(stale, Err(ReplayError::Stale { nonce: 1, last: 1 }));

        assert_eq!(guard.accept_with(2, || Ok::<_, ReplayError>(9)), Ok(9));
        assert_eq!(guard.last_accepted(), Some(2));
    }

    #[test]
    fn test_gaps_are_allowed() {
        let guard = ReplayGuard::new();
        guard.accept(1).unwrap();
        guard.accept(10).unwrap();
        assert!(guard.accept(9).is_err());
    }

    #[test]
    fn test_resync_rejects_in_flight_requests() {
        let guard = ReplayGuard::new();
        guard.accept(2).unwrap();

        // Session resumed at nonce 7: anything stamped at or before it is stale
        guard.resync(7);
        assert!(guard.accept(5).is_err());
        assert!(guard.accept(7).is_err());
        guard.accept(8).unwrap();
    }
}
