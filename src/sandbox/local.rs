//! Local facility
//!
//! Runs commands as plain child processes in a scratch directory. There is no
//! isolation and only the wall clock limit is enforced (by killing the whole
//! process group); cpu time is reported as wall time and memory as zero.
//! Meant for development machines and tests where isolate is unavailable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::meta::{render_meta, ProcessMetrics, SandboxStatus};
use super::{Invocation, Isolation};

/// Unsandboxed facility rooted at a scratch directory
#[derive(Debug, Clone)]
pub struct LocalFacility {
    root: PathBuf,
}

impl LocalFacility {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn box_root(&self, box_id: u32) -> PathBuf {
        self.root.join(box_id.to_string())
    }
}

#[async_trait]
impl Isolation for LocalFacility {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn init(&self, box_id: u32) -> Result<PathBuf> {
        let box_root = self.box_root(box_id);
        if tokio::fs::try_exists(&box_root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&box_root)
                .await
                .with_context(|| format!("Failed to remove stale box {}", box_root.display()))?;
        }

        let work_dir = box_root.join("box");
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create box {}", work_dir.display()))?;
        debug!("Initialized local box {} at {}", box_id, work_dir.display());
        Ok(work_dir)
    }

    async fn cleanup(&self, box_id: u32) -> Result<()> {
        match tokio::fs::remove_dir_all(self.box_root(box_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clean up local box {}", box_id)),
        }
    }

    fn spawn(&self, inv: &Invocation) -> Result<Child> {
        let open = |name: &str| File::open(inv.work_dir.join(name));
        let create = |name: &str| File::create(inv.work_dir.join(name));

        let stdin = match (&inv.stdin_file, inv.piped) {
            (_, true) => Stdio::piped(),
            (Some(name), false) => Stdio::from(open(name).context("Failed to open stdin file")?),
            (None, false) => Stdio::null(),
        };
        let stdout = match (&inv.stdout_file, inv.piped) {
            (_, true) => Stdio::piped(),
            (Some(name), false) => {
                Stdio::from(create(name).context("Failed to create stdout file")?)
            }
            (None, false) => Stdio::null(),
        };
        let stderr =
            Stdio::from(create(&inv.stderr_file).context("Failed to create stderr file")?);

        debug!("Running locally in {}: {}", inv.work_dir.display(), inv.command);

        Command::new("/bin/sh")
            .arg("-c")
            .arg(&inv.command)
            .current_dir(&inv.work_dir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .context("Failed to spawn local process")
    }

    async fn finish(&self, inv: &Invocation, mut child: Child, started: Instant) -> Result<String> {
        let limit = inv.constraints.wall_time();
        let remaining = limit.saturating_sub(started.elapsed());

        let waited = tokio::time::timeout(remaining, child.wait()).await;
        let mut metrics = ProcessMetrics::default();

        match waited {
            Ok(status) => {
                let status = status.context("Failed to wait for local process")?;
                if let Some(code) = status.code() {
                    metrics.exit_code = code;
                    if code != 0 {
                        metrics.status = SandboxStatus::RuntimeError;
                        metrics.message = Some(format!("Exited with error status {}", code));
                    }
                } else if let Some(sig) = status.signal() {
                    metrics.signal = Some(sig);
                    metrics.status = SandboxStatus::Signalled;
                    metrics.message = Some(format!("Caught fatal signal {}", sig));
                }
            }
            Err(_) => {
                if let Some(pid) = child.id() {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        warn!("Failed to kill process group {}: {}", pid, e);
                    }
                }
                let _ = child.wait().await;
                metrics.killed = true;
                metrics.status = SandboxStatus::TimedOut;
                metrics.message = Some("Time limit exceeded (wall clock)".to_string());
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        metrics.wall_time_ms = elapsed;
        metrics.cpu_time_ms = elapsed;

        Ok(render_meta(&metrics))
    }
}
