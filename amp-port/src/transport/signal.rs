//! Topology-change notification shared between a transport and its driver.
//!
//! A port hands an `Arc<TopologySignal>` to whatever notices bus resets (the
//! FireWire driver's reset handler, or the bridge engine when a response
//! carries a new epoch). The port takes the pending change before trusting
//! its node table again. There is no global list of live ports.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A detected change of bus topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChange {
    pub generation: u32,
}

#[derive(Debug, Default)]
pub struct TopologySignal {
    pending: AtomicBool,
    generation: AtomicU32,
    armed: AtomicBool,
}

impl TopologySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bus reset reaching `generation`.
    ///
    /// Raises the signal once per distinct generation value; repeating the
    /// last notified generation is ignored. Returns whether it was raised.
    pub fn notify(&self, generation: u32) -> bool {
        let previous = self.generation.swap(generation, Ordering::AcqRel);
        let was_armed = self.armed.swap(true, Ordering::AcqRel);
        if was_armed && previous == generation {
            return false;
        }
        self.pending.store(true, Ordering::Release);
        true
    }

    /// Set the reference generation without raising the signal.
    pub fn sync(&self, generation: u32) {
        self.generation.store(generation, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    /// Take the pending change, if any.
    pub fn take(&self) -> Option<TopologyChange> {
        if self.pending.swap(false, Ordering::AcqRel) {
            Some(TopologyChange {
                generation: self.generation.load(Ordering::Acquire),
            })
        } else {
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
