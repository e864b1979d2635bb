//! Per-node health accounting.

use serde::{Deserialize, Serialize};

use patchbay_core::now_iso;

/// Smoothing factor for the latency EWMA.
pub const EWMA_ALPHA: f64 = 0.3;

/// Rolling health for one node. Updated after every invocation, outside the
/// route-selection hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub ewma_latency_ms: Option<f64>,
    pub circuit_open_until: f64,
    pub updated_at: String,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            ewma_latency_ms: None,
            circuit_open_until: 0.0,
            updated_at: now_iso(),
        }
    }
}

impl NodeHealth {
    /// Record one invocation outcome. Success resets the consecutive
    /// failure streak and folds the measured latency into the EWMA.
    pub fn record(&mut self, success: bool, latency_ms: Option<f64>) {
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
            if let Some(latency) = latency_ms {
                self.ewma_latency_ms = Some(match self.ewma_latency_ms {
                    None => latency,
                    Some(previous) => (1.0 - EWMA_ALPHA) * previous + EWMA_ALPHA * latency,
                });
            }
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
        }
        self.updated_at = now_iso();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_latency_seeds_the_ewma() {
        let mut health = NodeHealth::default();
        health.record(true, Some(100.0));
        assert_eq!(health.ewma_latency_ms, Some(100.0));
        assert_eq!(health.success_count, 1);
    }

    #[test]
    fn ewma_uses_fixed_alpha() {
        let mut health = NodeHealth::default();
        health.record(true, Some(100.0));
        health.record(true, Some(200.0));
        let ewma = health.ewma_latency_ms.unwrap();
        assert!((ewma - 130.0).abs() < 1e-9, "expected 0.7*100 + 0.3*200, got {ewma}");
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut health = NodeHealth::default();
        health.record(false, None);
        health.record(false, None);
        assert_eq!(health.consecutive_failures, 2);
        health.record(true, Some(10.0));
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.failure_count, 2);
    }
}
