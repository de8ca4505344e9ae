use capp_store::ObjectId;
use dashmap::DashMap;
use tokio::time::Duration;

/// Per-Capp exponential backoff: `base * 2^failures`, capped at `max`.
/// A successful pass resets the count.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: DashMap<ObjectId, u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: DashMap::new(),
        }
    }

    /// Records a failure and returns how long to wait before the next pass.
    pub fn next_delay(&self, id: &ObjectId) -> Duration {
        let mut n = self.failures.entry(id.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&self, id: &ObjectId) {
        self.failures.remove(id);
    }

    pub fn failures(&self, id: &ObjectId) -> u32 {
        self.failures.get(id).map(|n| *n).unwrap_or(0)
    }
}
