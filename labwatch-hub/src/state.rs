/*!
 * ÉTAT PARTAGÉ - Primitives de partage entre tâches du hub
 *
 * RÔLE :
 * `Shared<T>` = section critique courte (parking_lot, jamais tenue à travers
 * un `.await`). `Counter` = compteur monotone lisible depuis l'API admin.
 */

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Compteur monotone (drops, échecs, recomputes...)
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
