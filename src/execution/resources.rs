//! Resource ceilings for sandboxed render runs.

use serde::{Deserialize, Serialize};

/// Resource limits applied to a render container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            max_processes: 256,
        }
    }
}

impl ExecutionLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// CPU quota for the configured cores: `period * cores`.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    pub fn pids_limit(&self) -> i64 {
        self.max_processes as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_bytes(), 1024 * 1024 * 1024);
        assert_eq!(limits.cpu_quota(), 100_000);
        assert_eq!(limits.pids_limit(), 256);
    }

    #[test]
    fn test_fractional_cpu_quota() {
        let limits = ExecutionLimits::new(512, 0.5, 64);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 50_000);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }
}
