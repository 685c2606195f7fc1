//! Collapse concurrent calls for the same key into one execution.
//!
//! The first caller for a key runs the operation; callers arriving while it is
//! in flight, or within `min_interval` of its start, receive a clone of the
//! same result. The map lock is released before the operation is awaited.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

struct Slot<V> {
    cell: OnceCell<V>,
    started: Instant,
}

/// An unfinished slot is live only while some caller still awaits it.
fn live<V>(slot: &Arc<Slot<V>>, min_interval: Duration) -> bool {
    if slot.cell.initialized() {
        slot.started.elapsed() < min_interval
    } else {
        Arc::strong_count(slot) > 1
    }
}

pub struct SingleFlight<V> {
    min_interval: Duration,
    slots: Mutex<HashMap<String, Arc<Slot<V>>>>,
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl<V: Clone> SingleFlight<V> {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn run<F, Fut>(&self, key: &str, op: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.retain(|_, slot| live(slot, self.min_interval));
            if let Some(slot) = slots.get(key) {
                Arc::clone(slot)
            } else {
                let slot = Arc::new(Slot {
                    cell: OnceCell::new(),
                    started: Instant::now(),
                });
                slots.insert(key.to_string(), Arc::clone(&slot));
                slot
            }
        };
        slot.cell.get_or_init(op).await.clone()
    }

    /// Forget any result recorded for `key`.
    pub async fn forget(&self, key: &str) {
        self.slots.lock().await.remove(key);
    }
}
