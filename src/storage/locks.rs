//! Per-pull-request lock registry.
//!
//! Reviewer mutations must not interleave on the same pull request, but
//! unrelated pull requests should proceed in parallel. [`PrLocks`] hands
//! out one async mutex per pull request id on demand. Guards are owned,
//! so they can be held across await points and returned from helper
//! functions.
//!
//! The registry never removes entries; it grows with the set of pull
//! request ids ever touched, a few dozen bytes each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct PrLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PrLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, pull_request_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(pull_request_id.to_string())
            .or_default()
            .clone()
    }

    /// Take the lock for one pull request, waiting if another task holds
    /// it. The registry's own mutex is released before awaiting.
    pub async fn acquire(&self, pull_request_id: &str) -> OwnedMutexGuard<()> {
        self.entry(pull_request_id).lock_owned().await
    }

    /// Take the locks for a set of pull requests.
    ///
    /// Ids are deduplicated and acquired in sorted order, so two tasks
    /// locking overlapping sets cannot deadlock against each other.
    pub async fn acquire_many(&self, pull_request_ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&String> = pull_request_ids.iter().collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.acquire(id).await);
        }
        guards
    }
}
