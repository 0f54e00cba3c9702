//! Isolate facility
//!
//! Drives the `isolate` binary for box initialization, cleanup and command
//! execution. See: https://github.com/ioi/isolate

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{Invocation, Isolation};
use crate::config::SandboxConfig;

/// Isolation facility backed by the isolate sandbox
#[derive(Debug, Clone)]
pub struct IsolateFacility {
    binary: PathBuf,
    use_cgroups: bool,
    dirs: Vec<String>,
    env: Vec<String>,
}

impl IsolateFacility {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            binary: config.isolate_path.clone(),
            use_cgroups: config.use_cgroups,
            dirs: config.dirs.clone(),
            env: config.env.clone(),
        }
    }

    fn box_args(&self, box_id: u32) -> Vec<String> {
        let mut args = vec!["--box-id".to_string(), box_id.to_string()];
        if self.use_cgroups {
            args.push("--cg".to_string());
        }
        args
    }

    /// Arguments for `isolate --run` of one invocation
    pub fn run_args(&self, inv: &Invocation) -> Vec<String> {
        let limits = &inv.constraints;
        let mut args = self.box_args(inv.box_id);

        if self.use_cgroups {
            args.push(format!("--cg-mem={}", limits.memory_kb));
        } else {
            args.push(format!("--mem={}", limits.memory_kb));
        }

        args.extend([
            format!("--time={}", secs(limits.cpu_time_ms)),
            format!("--extra-time={}", secs(limits.extra_time_ms)),
            format!("--wall-time={}", secs(limits.wall_time_ms)),
            format!("--meta={}", inv.meta_path.display()),
            format!("--processes={}", limits.processes),
            format!("--open-files={}", limits.open_files),
            format!("--fsize={}", limits.output_kb),
            format!("--stderr={}", inv.stderr_file),
        ]);

        if let Some(stdin) = &inv.stdin_file {
            args.push(format!("--stdin={}", stdin));
        }
        if let Some(stdout) = &inv.stdout_file {
            args.push(format!("--stdout={}", stdout));
        }

        args.extend(self.dirs.iter().map(|dir| format!("--dir={}", dir)));
        args.extend(self.env.iter().map(|env| format!("--env={}", env)));

        args.extend([
            "--run".to_string(),
            "--".to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            inv.command.clone(),
        ]);
        args
    }
}

/// Milliseconds as isolate's fractional seconds
fn secs(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

#[async_trait]
impl Isolation for IsolateFacility {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn init(&self, box_id: u32) -> Result<PathBuf> {
        // Clean up any existing box
        let _ = Command::new(&self.binary)
            .args(self.box_args(box_id))
            .arg("--cleanup")
            .output()
            .await;

        let output = Command::new(&self.binary)
            .args(self.box_args(box_id))
            .arg("--init")
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", box_id, stderr.trim());
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            "Initialized isolate box {} at {} (cgroups: {})",
            box_id, box_path, self.use_cgroups
        );

        Ok(PathBuf::from(box_path).join("box"))
    }

    async fn cleanup(&self, box_id: u32) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(self.box_args(box_id))
            .arg("--cleanup")
            .output()
            .await
            .context("Failed to run isolate --cleanup")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to clean up isolate box {}: {}", box_id, stderr.trim());
        }
        debug!("Cleaned up isolate box {}", box_id);
        Ok(())
    }

    fn spawn(&self, inv: &Invocation) -> Result<Child> {
        let args = self.run_args(inv);
        debug!("Running isolate with args: {:?}", args);

        let (stdin, stdout) = if inv.piped {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };

        Command::new(&self.binary)
            .args(&args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn isolate")
    }

    async fn finish(&self, inv: &Invocation, child: Child, _started: Instant) -> Result<String> {
        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for isolate")?;

        // isolate exits with 1 when the program failed, >1 when isolate itself did
        if output.status.code().map_or(true, |code| code > 1) {
            warn!(
                "isolate box {} exited with {}: {}",
                inv.box_id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let meta = fs::read_to_string(&inv.meta_path).await.with_context(|| {
            format!(
                "Failed to read isolate meta file {} (isolate: {})",
                inv.meta_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )
        })?;
        let _ = fs::remove_file(&inv.meta_path).await;

        Ok(meta)
    }
}
