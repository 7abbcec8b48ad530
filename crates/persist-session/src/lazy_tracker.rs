//! Lazy-load (N+1) detection.
//!
//! Loading N owners and then touching a lazy association on each one costs
//! N+1 round trips where a fetch graph or `multi_load` would cost two. The
//! tracker counts lazy initializations per navigable role and logs a warning
//! when one role reaches the configured threshold.

use persist_core::NavigableRole;
use std::collections::HashMap;

/// Statistics about lazy initializations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LazyLoadStats {
    /// Total lazy initializations recorded.
    pub total_loads: usize,
    /// Distinct roles initialized lazily.
    pub roles_loaded: usize,
    /// Roles whose count reached the threshold.
    pub potential_n1: usize,
}

/// Counts lazy initializations per role.
#[derive(Debug, Clone)]
pub struct LazyLoadTracker {
    counts: HashMap<NavigableRole, usize>,
    threshold: usize,
}

impl Default for LazyLoadTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

impl LazyLoadTracker {
    /// Create a tracker warning at `threshold` loads of one role. 0 disables.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Record one lazy initialization of `role`.
    pub fn record(&mut self, role: &NavigableRole) {
        if !self.is_enabled() {
            return;
        }
        let count = self.counts.entry(role.clone()).or_insert(0);
        *count += 1;
        tracing::trace!(role = %role, count = *count, "Lazy initialization");
        if *count == self.threshold {
            tracing::warn!(
                target: "persist::lazy",
                role = %role,
                loads = *count,
                threshold = self.threshold,
                "Repeated lazy initialization of one role; consider a fetch graph or multi_load"
            );
        }
    }

    /// Lazy initializations recorded for `role`.
    #[must_use]
    pub fn count_for(&self, role: &NavigableRole) -> usize {
        self.counts.get(role).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> LazyLoadStats {
        LazyLoadStats {
            total_loads: self.counts.values().sum(),
            roles_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|&&count| count >= self.threshold)
                .count(),
        }
    }

    /// Forget all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
