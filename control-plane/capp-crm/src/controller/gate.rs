use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use capp_store::ObjectId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use super::outcome::PassReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassResult {
    /// The caller ran the pass (and any re-runs requested meanwhile);
    /// carries the report of the last one
    Completed(PassReport),
    /// A pass for the same Capp was already running; it will run again
    /// on the caller's behalf. If that running pass is cancelled first the
    /// re-run is lost and counted in [`PassGate::abandoned_reruns`]; the
    /// next trigger for the Capp picks the work up.
    Coalesced,
}

#[derive(Debug, Default)]
struct Slot {
    rerun: bool,
}

/// Serializes passes per Capp identity. Passes for different identities
/// run concurrently; triggers arriving while a pass is in flight collapse
/// into a single re-run performed by the worker that holds the slot.
#[derive(Debug, Default)]
pub struct PassGate {
    slots: DashMap<ObjectId, Slot>,
    abandoned: AtomicUsize,
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, id: &ObjectId) -> bool {
        self.slots.contains_key(id)
    }

    /// Coalesced re-runs dropped because the pass holding them was
    /// cancelled.
    pub fn abandoned_reruns(&self) -> usize {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub async fn run<F, Fut>(&self, id: &ObjectId, mut pass: F) -> PassResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PassReport>,
    {
        match self.slots.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().rerun = true;
                debug!(%id, "pass in flight, coalescing trigger");
                return PassResult::Coalesced;
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::default());
            }
        }
        let guard = SlotGuard {
            gate: self,
            id,
            armed: true,
        };

        loop {
            let report = pass().await;
            if self.slots.remove_if(id, |_, s| !s.rerun).is_some() {
                guard.disarm();
                return PassResult::Completed(report);
            }
            if let Some(mut slot) = self.slots.get_mut(id) {
                slot.rerun = false;
            }
            debug!(%id, "re-running coalesced pass");
        }
    }
}

// Frees the slot if the pass future is dropped mid-flight.
struct SlotGuard<'a> {
    gate: &'a PassGate,
    id: &'a ObjectId,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some((_, slot)) = self.gate.slots.remove(self.id) {
            if slot.rerun {
                self.gate.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(id = %self.id, "pass cancelled, coalesced re-run dropped");
            }
        }
    }
}
