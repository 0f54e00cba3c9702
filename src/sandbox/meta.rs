//! Sandbox result record parser
//!
//! Parses the key:value record the isolation facility writes after every run
//! (isolate's `--meta` file format) into [`ProcessMetrics`].

use serde::{Deserialize, Serialize};

/// Status reported by the isolation facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Program exited normally with exit code 0
    Ok,
    /// Cpu or wall time limit exceeded
    TimedOut,
    /// Killed by a signal
    Signalled,
    /// Exited with a non-zero exit code
    RuntimeError,
    /// The facility itself failed
    InternalError,
}

/// Resource usage of one finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    /// Peak memory in KB (max of cgroup and rss accounting)
    pub memory_kb: u64,
    pub voluntary_switches: u64,
    pub forced_switches: u64,
    pub status: SandboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The facility killed the program (limits exceeded)
    pub killed: bool,
    /// The cgroup OOM killer fired
    pub oom_killed: bool,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self {
            exit_code: 0,
            signal: None,
            cpu_time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            voluntary_switches: 0,
            forced_switches: 0,
            status: SandboxStatus::Ok,
            message: None,
            killed: false,
            oom_killed: false,
        }
    }
}

impl ProcessMetrics {
    /// Exited on its own with status OK and exit code 0
    pub fn is_success(&self) -> bool {
        self.status == SandboxStatus::Ok && self.exit_code == 0
    }
}

/// Captured output of one run joined with its metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeData {
    pub stdout: String,
    pub stderr: String,
    /// stdout or stderr was cut to the transport bound
    #[serde(default)]
    pub truncated: bool,
    pub metrics: ProcessMetrics,
}

impl RuntimeData {
    /// Text the compiler or program printed, stderr first
    pub fn diagnostics(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, true) => self.stderr.clone(),
            (true, false) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stderr, self.stdout),
            (true, true) => self
                .metrics
                .message
                .clone()
                .unwrap_or_else(|| format!("exit code {}", self.metrics.exit_code)),
        }
    }
}

fn seconds_to_ms(value: &str) -> Option<u64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| (t * 1000.0).round() as u64)
}

/// Parse result record content
pub fn parse_meta(content: &str) -> ProcessMetrics {
    let mut meta = ProcessMetrics::default();
    let mut status_str = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "time" => {
                if let Some(ms) = seconds_to_ms(value) {
                    meta.cpu_time_ms = ms;
                }
            }
            "time-wall" => {
                if let Some(ms) = seconds_to_ms(value) {
                    meta.wall_time_ms = ms;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "csw-voluntary" => meta.voluntary_switches = value.parse().unwrap_or(0),
            "csw-forced" => meta.forced_switches = value.parse().unwrap_or(0),
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => meta.signal = value.parse().ok(),
            "killed" => meta.killed = value == "1",
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "message" => meta.message = Some(value.to_string()),
            "status" => status_str = value.to_string(),
            _ => {}
        }
    }

    meta.status = match status_str.as_str() {
        "TO" => SandboxStatus::TimedOut,
        "SG" => SandboxStatus::Signalled,
        "RE" => SandboxStatus::RuntimeError,
        "XX" => SandboxStatus::InternalError,
        "" if meta.signal.is_some() => SandboxStatus::Signalled,
        "" if meta.exit_code == 0 => SandboxStatus::Ok,
        _ => SandboxStatus::RuntimeError,
    };

    meta
}

/// Render metrics back into the record format (used by facilities that
/// measure the run themselves)
pub fn render_meta(meta: &ProcessMetrics) -> String {
    let mut out = format!(
        "time:{:.3}\ntime-wall:{:.3}\nmax-rss:{}\ncsw-voluntary:{}\ncsw-forced:{}\n",
        meta.cpu_time_ms as f64 / 1000.0,
        meta.wall_time_ms as f64 / 1000.0,
        meta.memory_kb,
        meta.voluntary_switches,
        meta.forced_switches,
    );
    match meta.signal {
        Some(sig) => out.push_str(&format!("exitsig:{}\n", sig)),
        None => out.push_str(&format!("exitcode:{}\n", meta.exit_code)),
    }
    if meta.killed {
        out.push_str("killed:1\n");
    }
    let status = match meta.status {
        SandboxStatus::Ok => None,
        SandboxStatus::TimedOut => Some("TO"),
        SandboxStatus::Signalled => Some("SG"),
        SandboxStatus::RuntimeError => Some("RE"),
        SandboxStatus::InternalError => Some("XX"),
    };
    if let Some(status) = status {
        out.push_str(&format!("status:{}\n", status));
    }
    if let Some(message) = &meta.message {
        out.push_str(&format!("message:{}\n", message));
    }
    out
}
