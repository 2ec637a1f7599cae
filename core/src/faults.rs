//! Short-TTL backoff cache for failed peer targets. A target that just
//! failed is blocked from immediate retry so one unreachable peer cannot
//! consume groom-loop time every cycle.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct FaultTracker {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl FaultTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, target: &str) {
        debug!("fault recorded for {}", target);
        self.entries
            .lock()
            .insert(target.to_string(), Instant::now());
    }

    pub fn is_blocked(&self, target: &str) -> bool {
        self.entries
            .lock()
            .get(target)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Drop entries past their TTL. Called once per groom cycle.
    pub fn expire(&self) {
        let ttl = self.ttl;
        self.entries.lock().retain(|_, at| at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
