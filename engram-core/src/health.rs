//! Health check types

use serde::{Deserialize, Serialize};

/// Aggregate health report for the `health` tool and HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub storage_ok: bool,
    pub cache_ok: bool,
    pub embedding_enabled: bool,
    pub embedding_queue_depth: usize,
    pub uptime_secs: u64,
    pub version: String,
}

impl HealthStatus {
    /// Overall health is the conjunction of the component checks; the
    /// embedding queue is informational only.
    pub fn evaluate(storage_ok: bool, cache_ok: bool) -> bool {
        storage_ok && cache_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_conjunction() {
        assert!(HealthStatus::evaluate(true, true));
        assert!(!HealthStatus::evaluate(false, true));
        assert!(!HealthStatus::evaluate(true, false));
    }
}
