//! Learned, per-family knowledge of which features a transaction needs.
//!
//! Every family starts in the cheapest flavor. When an attempt trips over a
//! feature its flavor cannot serve, it records that here and the next attempt
//! (and every later transaction of the family) starts richer. Knowledge only
//! accumulates; nothing ever downgrades a family.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tracing::debug;

use crate::stm::config::TxnConfig;
use crate::types::{IsolationLevel, LockMode, SpeculativeFeature, TxnFlavor};

fn feature_bit(feature: SpeculativeFeature) -> u32 {
    match feature {
        SpeculativeFeature::Size => 0,
        SpeculativeFeature::Construction => 1 << 0,
        SpeculativeFeature::Commute => 1 << 1,
        SpeculativeFeature::Ensure => 1 << 2,
        SpeculativeFeature::Locks => 1 << 3,
        SpeculativeFeature::NonPrimitivePayload => 1 << 4,
        SpeculativeFeature::Timeout => 1 << 5,
        SpeculativeFeature::Listeners => 1 << 6,
    }
}

/// Shared speculative profile of one transaction family.
#[derive(Debug)]
pub struct SpeculativeConfiguration {
    features: AtomicU32,
    minimal_length: AtomicUsize,
    max_fixed_length: usize,
}

impl SpeculativeConfiguration {
    /// Fresh profile: lean, one object.
    pub fn new(max_fixed_length: usize) -> Self {
        Self {
            features: AtomicU32::new(0),
            minimal_length: AtomicUsize::new(1),
            max_fixed_length: max_fixed_length.max(2),
        }
    }

    /// Records that the family needs `feature`.
    pub fn signal(&self, feature: SpeculativeFeature) {
        let bit = feature_bit(feature);
        if bit == 0 {
            return;
        }
        let previous = self.features.fetch_or(bit, Ordering::AcqRel);
        if previous & bit == 0 {
            debug!(%feature, "speculative profile widened");
        }
    }

    /// Records that an attempt holding `observed` objects needed one more.
    pub fn signal_size(&self, observed: usize) {
        let needed = observed.saturating_add(1);
        let previous = self.minimal_length.fetch_max(needed, Ordering::AcqRel);
        if needed > previous {
            debug!(minimal_length = needed, "speculative profile grew");
        }
    }

    /// Returns `true` once `feature` was signalled.
    pub fn needs(&self, feature: SpeculativeFeature) -> bool {
        match feature {
            SpeculativeFeature::Size => self.minimal_length() > 1,
            other => self.features.load(Ordering::Acquire) & feature_bit(other) != 0,
        }
    }

    /// Returns `true` once any fat-only feature was signalled.
    pub fn is_fat(&self) -> bool {
        self.features.load(Ordering::Acquire) != 0
    }

    /// Smallest object count the family is known to need.
    pub fn minimal_length(&self) -> usize {
        self.minimal_length.load(Ordering::Acquire)
    }

    /// Largest object count a fixed-length flavor holds.
    pub fn max_fixed_length(&self) -> usize {
        self.max_fixed_length
    }

    /// Picks the flavor for the next attempt.
    pub fn choose_flavor(&self, config: &TxnConfig) -> TxnFlavor {
        if !config.speculative {
            return TxnFlavor::FatVariableLength;
        }
        let size = self.minimal_length();
        if size > self.max_fixed_length {
            return TxnFlavor::FatVariableLength;
        }
        let fat = self.is_fat() || !lean_allowed(config);
        match (size <= 1, fat) {
            (true, false) => TxnFlavor::LeanMono,
            (true, true) => TxnFlavor::FatMono,
            (false, false) => TxnFlavor::LeanFixedLength,
            (false, true) => TxnFlavor::FatFixedLength,
        }
    }
}

/// Configurations that need fat features from the very first access.
fn lean_allowed(config: &TxnConfig) -> bool {
    config.isolation == IsolationLevel::Snapshot
        && config.read_lock_mode == LockMode::None
        && config.write_lock_mode == LockMode::None
        && config.permanent_listeners.is_empty()
}
