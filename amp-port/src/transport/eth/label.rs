//! Transaction labels and the cached topology epoch.

/// Number of distinct transaction labels (6 bits).
pub const LABEL_COUNT: u8 = 64;

/// 6-bit transaction label counter.
///
/// Each request takes the next label; labels wrap modulo 64, so up to 64
/// requests can be outstanding without two sharing a label.
#[derive(Debug, Clone, Default)]
pub struct TransactionLabels {
    next: u8,
}

impl TransactionLabels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the label for a new request.
    pub fn next_label(&mut self) -> u8 {
        let label = self.next;
        self.next = (self.next + 1) % LABEL_COUNT;
        label
    }

    /// Label the next request will get.
    pub fn peek(&self) -> u8 {
        self.next
    }
}

/// Epoch (bus generation) as last seen from the bridge.
///
/// Only the low 8 bits travel on the wire.
#[derive(Debug, Clone, Default)]
pub struct EpochCache {
    current: u8,
}

impl EpochCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Adopt an epoch learned through a status read.
    pub fn set(&mut self, epoch: u8) {
        self.current = epoch;
    }

    /// Compare an inbound epoch with the cache; on change, adopt it and
    /// return the new value.
    pub fn observe(&mut self, epoch: u8) -> Option<u8> {
        if epoch == self.current {
            None
        } else {
            self.current = epoch;
            Some(epoch)
        }
    }
}
