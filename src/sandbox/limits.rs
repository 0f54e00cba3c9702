use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits for one sandboxed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConstraints {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u64,
    /// Grace cpu time before the process is killed, in milliseconds
    pub extra_time_ms: u64,
    /// Wall clock limit in milliseconds
    pub wall_time_ms: u64,
    /// Memory limit in KB
    pub memory_kb: u64,
    /// Maximum number of processes/threads
    pub processes: u32,
    /// Maximum open files
    pub open_files: u32,
    /// Maximum size of any file the program writes, in KB
    pub output_kb: u64,
}

impl Default for RuntimeConstraints {
    fn default() -> Self {
        Self {
            cpu_time_ms: 50_000,
            extra_time_ms: 500,
            wall_time_ms: 10_000,
            memory_kb: 2 * 1024 * 1024,
            processes: 128,
            open_files: 128,
            output_kb: 256 * 1024,
        }
    }
}

impl RuntimeConstraints {
    /// Limits for running a submission against one test: wall time is twice
    /// the cpu limit plus one second.
    pub fn for_test(cpu_time_ms: u64, memory_kb: u64) -> Self {
        Self {
            cpu_time_ms,
            wall_time_ms: cpu_time_ms.saturating_mul(2).saturating_add(1000),
            memory_kb,
            ..Self::default()
        }
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }
}
