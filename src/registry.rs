//! Identifier registry: the owner of session and tunnel ids.
//!
//! Ids are random 64-bit keys, unique within one registry for as long as the
//! entry stays in it. Callers never pick ids; `allocate` does, retrying on
//! the (astronomically rare) collision. The same seeded generator also hands
//! out ephemeral port candidates for tunnel allocation.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::config::PortRange;

pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    entries: HashMap<u64, Arc<T>>,
    rng: StdRng,
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    /// Insert `entry` under a fresh random id and return the id.
    pub async fn allocate(&self, entry: Arc<T>) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = loop {
            let candidate = inner.rng.random::<u64>();
            if !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.entries.insert(id, entry);
        id
    }

    pub async fn get(&self, id: u64) -> Option<Arc<T>> {
        self.inner.lock().await.entries.get(&id).cloned()
    }

    /// Delete the entry if present. Idempotent.
    pub async fn remove(&self, id: u64) -> Option<Arc<T>> {
        self.inner.lock().await.entries.remove(&id)
    }

    pub async fn ids(&self) -> Vec<u64> {
        self.inner.lock().await.entries.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// A random candidate port from `range`, drawn from the registry's
    /// seeded generator.
    pub async fn random_port(&self, range: &PortRange) -> u16 {
        let mut inner = self.inner.lock().await;
        inner.rng.random_range(range.begin..=range.end)
    }
}
