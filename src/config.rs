//! Judge configuration
//!
//! Loaded from an optional TOML file and overridden by environment variables
//! (after `.env` is read). The resulting value is handed to constructors; there
//! is no process-global configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::sandbox::RuntimeConstraints;

/// Which isolation facility backs the sandbox manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityKind {
    /// The `isolate` binary (namespaces + cgroups)
    Isolate,
    /// Plain child processes in a scratch directory, no isolation
    Local,
}

impl FromStr for FacilityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "local" => Ok(Self::Local),
            other => anyhow::bail!("Unknown sandbox facility: {}", other),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub facility: FacilityKind,
    /// Path to the isolate binary
    pub isolate_path: PathBuf,
    /// Pass `--cg` and cgroup memory limits to isolate
    pub use_cgroups: bool,
    /// First box id owned by this worker
    pub first_box_id: u32,
    /// Number of box ids (and therefore concurrent contexts) available
    pub box_count: u32,
    /// Scratch root for the local facility
    pub local_root: PathBuf,
    /// Directory rules passed to isolate as `--dir=`
    pub dirs: Vec<String>,
    /// Environment passed to sandboxed programs as `--env=`
    pub env: Vec<String>,
    /// Bound on captured stdout/stderr kept in runtime data, in bytes
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            facility: FacilityKind::Isolate,
            isolate_path: PathBuf::from("isolate"),
            use_cgroups: true,
            first_box_id: 0,
            box_count: 100,
            local_root: std::env::temp_dir().join("judge-boxes"),
            dirs: vec![
                "/usr".into(),
                "/lib".into(),
                "/lib64:maybe".into(),
                "/etc:noexec".into(),
            ],
            env: vec![
                "PATH=/usr/local/bin:/usr/bin:/bin".into(),
                "HOME=/box".into(),
            ],
            output_limit_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Config whose box ids live in the range reserved for `worker_id`.
    /// Isolate only supports ids 0-9999, so each of up to ten workers gets
    /// a block of 1000.
    pub fn with_worker_id(worker_id: u32) -> Self {
        Self {
            first_box_id: (worker_id % 10) * 1000,
            box_count: 1000,
            ..Self::default()
        }
    }
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable cache directory for fetched test data
    pub cache_dir: PathBuf,
    /// Number of fetches running at the same time
    pub fetch_concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/judge_cache/artifacts"),
            fetch_concurrency: 4,
        }
    }
}

/// Compilation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Cache directory for compiled checkers and interactors
    pub cache_dir: PathBuf,
    pub limits: RuntimeConstraints,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/judge_cache/compiled"),
            limits: RuntimeConstraints {
                cpu_time_ms: 30_000,
                wall_time_ms: 60_000,
                ..RuntimeConstraints::default()
            },
        }
    }
}

/// Evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Tests executed at the same time; events are still emitted in order
    pub test_concurrency: usize,
    /// Limits applied to checker and interactor runs
    pub checker_limits: RuntimeConstraints,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            test_concurrency: 1,
            checker_limits: RuntimeConstraints {
                cpu_time_ms: 10_000,
                wall_time_ms: 30_000,
                memory_kb: 1024 * 1024,
                ..RuntimeConstraints::default()
            },
        }
    }
}

/// Complete judge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
    pub compile: CompileConfig,
    pub evaluation: EvaluationConfig,
}

impl JudgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid judge configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load from `JUDGE_CONFIG` (if set) and apply environment overrides
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("JUDGE_CONFIG") {
            Ok(path) => {
                info!("Loading judge configuration from {}", path);
                Self::from_file(&path)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = parse_var::<FacilityKind>(&lookup, "JUDGE_SANDBOX_FACILITY")? {
            self.sandbox.facility = v;
        }
        if let Some(v) = lookup("ISOLATE_PATH") {
            self.sandbox.isolate_path = v.into();
        }
        if let Some(v) = lookup("ISOLATE_USE_CGROUPS") {
            self.sandbox.use_cgroups = v == "true" || v == "1";
        }
        if let Some(worker_id) = parse_var::<u32>(&lookup, "JUDGE_WORKER_ID")? {
            let defaults = SandboxConfig::with_worker_id(worker_id);
            self.sandbox.first_box_id = defaults.first_box_id;
            self.sandbox.box_count = defaults.box_count;
        }
        if let Some(v) = parse_var(&lookup, "JUDGE_BOX_COUNT")? {
            self.sandbox.box_count = v;
        }
        if let Some(v) = lookup("JUDGE_CACHE_DIR") {
            let root = PathBuf::from(v);
            self.storage.cache_dir = root.join("artifacts");
            self.compile.cache_dir = root.join("compiled");
        }
        if let Some(v) = parse_var(&lookup, "JUDGE_FETCH_CONCURRENCY")? {
            self.storage.fetch_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "JUDGE_TEST_CONCURRENCY")? {
            self.evaluation.test_concurrency = v;
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", name, raw, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JudgeConfig::from_toml_str(
            r#"
[sandbox]
facility = "local"
box_count = 8

[evaluation]
test_concurrency = 4
"#,
        )
        .unwrap();

        assert_eq!(config.sandbox.facility, FacilityKind::Local);
        assert_eq!(config.sandbox.box_count, 8);
        assert!(config.sandbox.use_cgroups);
        assert_eq!(config.evaluation.test_concurrency, 4);
        assert_eq!(config.storage.fetch_concurrency, 4);
        assert_eq!(config.compile.limits.cpu_time_ms, 30_000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("JUDGE_SANDBOX_FACILITY", "Local"),
            ("JUDGE_WORKER_ID", "3"),
            ("JUDGE_CACHE_DIR", "/var/cache/judge"),
            ("JUDGE_TEST_CONCURRENCY", "2"),
        ]
        .into_iter()
        .collect();

        let mut config = JudgeConfig::default();
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sandbox.facility, FacilityKind::Local);
        assert_eq!(config.sandbox.first_box_id, 3000);
        assert_eq!(config.sandbox.box_count, 1000);
        assert_eq!(
            config.storage.cache_dir,
            PathBuf::from("/var/cache/judge/artifacts")
        );
        assert_eq!(config.evaluation.test_concurrency, 2);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut config = JudgeConfig::default();
        let err = config
            .apply_env(|name| (name == "JUDGE_BOX_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("JUDGE_BOX_COUNT"));
    }
}
