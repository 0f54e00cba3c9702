//! Sandbox manager
//!
//! Owns the pool of box ids and hands out [`SandboxContext`] handles. A
//! context must be released with [`SandboxContext::destroy`]; a handle that is
//! dropped instead is cleaned up by a background task before its id goes back
//! to the pool. Callers that need several boxes at once reserve them together
//! with [`SandboxManager::create_contexts`].

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::fs;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::meta::{parse_meta, ProcessMetrics, RuntimeData};
use super::{
    Invocation, Isolation, IsolateFacility, LocalFacility, RuntimeConstraints, STDERR_FILE,
    STDIN_FILE, STDOUT_FILE,
};
use crate::config::{FacilityKind, SandboxConfig};
use crate::core::utils::bounded_text;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox id pool is closed")]
    PoolClosed,
    #[error("no free sandbox id in {first}..{end}")]
    PoolExhausted { first: u32, end: u32 },
    #[error("{requested} sandboxes requested but the pool only has {box_count}")]
    PoolTooSmall { requested: u32, box_count: u32 },
    #[error("invalid sandbox path: {0}")]
    InvalidPath(String),
    #[error("sandbox {0} is already destroyed")]
    Destroyed(u32),
}

/// Lifecycle of a sandbox context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    InUse,
    Destroyed,
}

/// Where the program's stdin comes from
#[derive(Debug, Clone, Default)]
pub enum Stdin {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    /// stdin and stdout become pipes on the [`ProcessHandle`]
    Pipe,
}

struct Shared {
    isolation: Arc<dyn Isolation>,
    first_box_id: u32,
    box_count: u32,
    output_limit_bytes: usize,
    in_use: Mutex<BTreeSet<u32>>,
    permits: Arc<Semaphore>,
    runs: AtomicU64,
}

/// One reserved place in the pool; gives its permit back when dropped
struct Slot {
    permits: Arc<Semaphore>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.permits.add_permits(1);
    }
}

impl Shared {
    fn release(&self, box_id: u32) {
        match self.in_use.lock() {
            Ok(mut in_use) => {
                in_use.remove(&box_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&box_id);
            }
        }
    }
}

/// Allocates and tracks isolated execution contexts
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    pub fn new(config: &SandboxConfig, isolation: Arc<dyn Isolation>) -> Self {
        let box_count = config.box_count.max(1);
        Self {
            shared: Arc::new(Shared {
                isolation,
                first_box_id: config.first_box_id,
                box_count,
                output_limit_bytes: config.output_limit_bytes,
                in_use: Mutex::new(BTreeSet::new()),
                permits: Arc::new(Semaphore::new(box_count as usize)),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Manager backed by the facility named in the configuration
    pub fn from_config(config: &SandboxConfig) -> Self {
        let isolation: Arc<dyn Isolation> = match config.facility {
            FacilityKind::Isolate => Arc::new(IsolateFacility::new(config)),
            FacilityKind::Local => Arc::new(LocalFacility::new(&config.local_root)),
        };
        Self::new(config, isolation)
    }

    pub fn facility_name(&self) -> &'static str {
        self.shared.isolation.name()
    }

    /// Number of contexts currently alive
    pub fn live_contexts(&self) -> usize {
        self.shared
            .in_use
            .lock()
            .map(|in_use| in_use.len())
            .unwrap_or_default()
    }

    /// Size of the id pool
    pub fn box_count(&self) -> u32 {
        self.shared.box_count
    }

    /// Allocate the lowest free id and initialize a fresh box for it.
    ///
    /// Waits while every id is taken.
    pub async fn create_context(&self) -> Result<SandboxContext> {
        let mut slots = self.reserve(1).await?;
        let slot = slots.pop().ok_or(SandboxError::PoolClosed)?;
        self.open(slot).await
    }

    /// Allocate `count` boxes at once.
    ///
    /// All ids are reserved in one step, so callers never hold some boxes
    /// while waiting for the rest.
    pub async fn create_contexts(&self, count: u32) -> Result<Vec<SandboxContext>> {
        let slots = self.reserve(count).await?;
        let mut contexts = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.open(slot).await {
                Ok(ctx) => contexts.push(ctx),
                Err(e) => {
                    for ctx in contexts {
                        let box_id = ctx.id();
                        if let Err(cleanup) = ctx.destroy().await {
                            warn!("Failed to destroy sandbox {}: {:#}", box_id, cleanup);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(contexts)
    }

    async fn reserve(&self, count: u32) -> Result<Vec<Slot>, SandboxError> {
        if count > self.shared.box_count {
            return Err(SandboxError::PoolTooSmall {
                requested: count,
                box_count: self.shared.box_count,
            });
        }

        let permit = self
            .shared
            .permits
            .clone()
            .acquire_many_owned(count)
            .await
            .map_err(|_| SandboxError::PoolClosed)?;
        // Each slot returns its own share of the permit
        permit.forget();

        Ok((0..count)
            .map(|_| Slot {
                permits: Arc::clone(&self.shared.permits),
            })
            .collect())
    }

    async fn open(&self, slot: Slot) -> Result<SandboxContext> {
        let box_id = {
            let mut in_use = self
                .shared
                .in_use
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let first = self.shared.first_box_id;
            let end = first.saturating_add(self.shared.box_count);
            let id = (first..end)
                .find(|id| !in_use.contains(id))
                .ok_or(SandboxError::PoolExhausted { first, end })?;
            in_use.insert(id);
            id
        };

        let work_dir = match self.shared.isolation.init(box_id).await {
            Ok(dir) => dir,
            Err(e) => {
                self.shared.release(box_id);
                drop(slot);
                return Err(e.context(format!("Failed to create sandbox context {}", box_id)));
            }
        };

        Ok(SandboxContext {
            box_id,
            work_dir,
            state: ContextState::Created,
            shared: Arc::clone(&self.shared),
            slot: Some(slot),
        })
    }
}

/// Handle to one initialized box
pub struct SandboxContext {
    box_id: u32,
    work_dir: PathBuf,
    state: ContextState,
    shared: Arc<Shared>,
    slot: Option<Slot>,
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("box_id", &self.box_id)
            .field("work_dir", &self.work_dir)
            .field("state", &self.state)
            .finish()
    }
}

impl SandboxContext {
    pub fn id(&self) -> u32 {
        self.box_id
    }

    /// Host path of the box working directory
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let path = Path::new(relative);
        let safe = !relative.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(SandboxError::InvalidPath(relative.to_string()));
        }
        Ok(self.work_dir.join(path))
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.state == ContextState::Destroyed {
            return Err(SandboxError::Destroyed(self.box_id));
        }
        Ok(())
    }

    /// Write a file into the box before execution
    pub async fn add_file(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Write a file and mark it executable
    pub async fn add_executable(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        self.add_file(relative, bytes).await?;
        let path = self.resolve(relative)?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
        Ok(())
    }

    /// Read a file out of the box
    pub async fn get_file(&self, relative: &str) -> Result<Vec<u8>> {
        self.ensure_alive()?;
        let path = self.resolve(relative)?;
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    pub async fn has_file(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Start `command` under `constraints` (defaults when `None`).
    ///
    /// Returns as soon as the process is started.
    pub async fn run(
        &mut self,
        command: &str,
        stdin: Stdin,
        constraints: Option<&RuntimeConstraints>,
    ) -> Result<ProcessHandle> {
        self.ensure_alive()?;

        let piped = matches!(stdin, Stdin::Pipe);
        let stdin_file = match stdin {
            Stdin::Bytes(bytes) => {
                self.add_file(STDIN_FILE, &bytes).await?;
                Some(STDIN_FILE.to_string())
            }
            Stdin::Empty | Stdin::Pipe => None,
        };

        let run_no = self.shared.runs.fetch_add(1, Ordering::Relaxed);
        let invocation = Invocation {
            box_id: self.box_id,
            work_dir: self.work_dir.clone(),
            command: command.to_string(),
            stdin_file,
            stdout_file: (!piped).then(|| STDOUT_FILE.to_string()),
            stderr_file: STDERR_FILE.to_string(),
            piped,
            constraints: constraints.cloned().unwrap_or_default(),
            meta_path: std::env::temp_dir()
                .join(format!("isolate_meta_{}_{}.txt", self.box_id, run_no)),
        };

        let started = Instant::now();
        let mut child = self.shared.isolation.spawn(&invocation)?;
        let (stdin, stdout) = if piped {
            (child.stdin.take(), child.stdout.take())
        } else {
            (None, None)
        };
        self.state = ContextState::InUse;

        Ok(ProcessHandle {
            child,
            invocation,
            started,
            isolation: Arc::clone(&self.shared.isolation),
            output_limit_bytes: self.shared.output_limit_bytes,
            stdin,
            stdout,
        })
    }

    /// Release the box and its id
    pub async fn destroy(mut self) -> Result<()> {
        self.state = ContextState::Destroyed;
        let result = self.shared.isolation.cleanup(self.box_id).await;
        self.shared.release(self.box_id);
        self.slot.take();
        result
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        // Dropped without destroy(): clean up in the background, then free the id
        let box_id = self.box_id;
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = shared.isolation.cleanup(box_id).await {
                        warn!("Failed to clean up dropped sandbox {}: {:#}", box_id, e);
                    }
                    shared.release(box_id);
                    drop(slot);
                });
            }
            Err(_) => {
                warn!("Sandbox {} dropped outside a runtime; leaving it to the next init", box_id);
                shared.release(box_id);
                drop(slot);
            }
        }
    }
}

/// A started command
pub struct ProcessHandle {
    child: Child,
    invocation: Invocation,
    started: Instant,
    isolation: Arc<dyn Isolation>,
    output_limit_bytes: usize,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ProcessHandle {
    /// Write end of the program's stdin (only with [`Stdin::Pipe`])
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Read end of the program's stdout (only with [`Stdin::Pipe`])
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the process and the facility, then parse the result record.
    ///
    /// Limit violations are reported in the metrics; errors mean the
    /// facility itself could not be driven.
    pub async fn wait(self) -> Result<ProcessMetrics> {
        let ProcessHandle {
            child,
            invocation,
            started,
            isolation,
            ..
        } = self;
        let record = isolation.finish(&invocation, child, started).await?;
        let metrics = parse_meta(&record);
        debug!(
            "Box {} finished: status={:?} exit={} time={}ms wall={}ms mem={}KB",
            invocation.box_id,
            metrics.status,
            metrics.exit_code,
            metrics.cpu_time_ms,
            metrics.wall_time_ms,
            metrics.memory_kb
        );
        Ok(metrics)
    }

    /// [`wait`](Self::wait), then collect the bounded stdout and stderr
    pub async fn wait_with_output(self) -> Result<RuntimeData> {
        let work_dir = self.invocation.work_dir.clone();
        let stdout_file = self.invocation.stdout_file.clone();
        let stderr_file = self.invocation.stderr_file.clone();
        let limit = self.output_limit_bytes;

        let metrics = self.wait().await?;

        let stdout_bytes = match stdout_file {
            Some(name) => fs::read(work_dir.join(name)).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr_bytes = fs::read(work_dir.join(stderr_file))
            .await
            .unwrap_or_default();

        let (stdout, stdout_cut) = bounded_text(&stdout_bytes, limit);
        let (stderr, stderr_cut) = bounded_text(&stderr_bytes, limit);

        Ok(RuntimeData {
            stdout,
            stderr,
            truncated: stdout_cut || stderr_cut,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxStatus;
    use std::time::Duration;

    fn local_manager(root: &Path, box_count: u32) -> SandboxManager {
        let config = SandboxConfig {
            facility: FacilityKind::Local,
            local_root: root.to_path_buf(),
            first_box_id: 10,
            box_count,
            ..SandboxConfig::default()
        };
        SandboxManager::from_config(&config)
    }

    #[tokio::test]
    async fn test_add_file_get_file_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 2);
        let ctx = manager.create_context().await.unwrap();

        let bytes: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        ctx.add_file("data/blob.bin", &bytes).await.unwrap();

        assert!(ctx.has_file("data/blob.bin").await);
        assert_eq!(ctx.get_file("data/blob.bin").await.unwrap(), bytes);
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        let ctx = manager.create_context().await.unwrap();

        assert!(ctx.add_file("../outside", b"x").await.is_err());
        assert!(ctx.add_file("/etc/passwd", b"x").await.is_err());
        assert!(!ctx.has_file("../outside").await);
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_lowest_free_id_is_reused() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 4);

        let a = manager.create_context().await.unwrap();
        let b = manager.create_context().await.unwrap();
        assert_eq!((a.id(), b.id()), (10, 11));
        assert_eq!(manager.live_contexts(), 2);

        a.destroy().await.unwrap();
        let c = manager.create_context().await.unwrap();
        assert_eq!(c.id(), 10);

        b.destroy().await.unwrap();
        c.destroy().await.unwrap();
        assert_eq!(manager.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_create_waits_for_free_id() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        let first = manager.create_context().await.unwrap();

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_context().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        first.destroy().await.unwrap();
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second.id(), 10);
        second.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_contexts_reserves_together() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 2);

        // Two callers that each need the whole pool take turns
        let pairs: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let contexts = manager.create_contexts(2).await.unwrap();
                    let ids: Vec<_> = contexts.iter().map(|c| c.id()).collect();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    for ctx in contexts {
                        ctx.destroy().await.unwrap();
                    }
                    ids
                })
            })
            .collect();

        for pair in pairs {
            let ids = tokio::time::timeout(Duration::from_secs(5), pair)
                .await
                .expect("pool deadlocked")
                .unwrap();
            assert_eq!(ids, vec![10, 11]);
        }
        assert_eq!(manager.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_create_contexts_beyond_pool_size_fails() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);

        let err = manager.create_contexts(2).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::PoolTooSmall {
                requested: 2,
                box_count: 1
            })
        ));

        // Nothing was reserved by the failed call
        let ctx = manager.create_context().await.unwrap();
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_id_range_at_the_top_of_u32() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::from_config(&SandboxConfig {
            facility: FacilityKind::Local,
            local_root: root.path().to_path_buf(),
            first_box_id: u32::MAX - 1,
            box_count: 4,
            ..SandboxConfig::default()
        });

        let ctx = manager.create_context().await.unwrap();
        assert_eq!(ctx.id(), u32::MAX - 1);
        let err = manager.create_context().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::PoolExhausted { end: u32::MAX, .. })
        ));
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_context_is_released() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        drop(manager.create_context().await.unwrap());

        let ctx = tokio::time::timeout(Duration::from_secs(5), manager.create_context())
            .await
            .expect("id was not released")
            .unwrap();
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        let mut ctx = manager.create_context().await.unwrap();

        let handle = ctx
            .run(
                "read x; echo \"got $x\"; echo oops >&2; exit 3",
                Stdin::Bytes(b"42\n".to_vec()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ctx.state(), ContextState::InUse);

        let data = handle.wait_with_output().await.unwrap();
        assert_eq!(data.stdout, "got 42\n");
        assert_eq!(data.stderr, "oops\n");
        assert_eq!(data.metrics.exit_code, 3);
        assert_eq!(data.metrics.status, SandboxStatus::RuntimeError);
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_wall_time_limit_reports_timeout() {
        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        let mut ctx = manager.create_context().await.unwrap();

        let limits = RuntimeConstraints {
            wall_time_ms: 300,
            ..RuntimeConstraints::default()
        };
        let metrics = ctx
            .run("sleep 5", Stdin::Empty, Some(&limits))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(metrics.status, SandboxStatus::TimedOut);
        assert!(metrics.wall_time_ms >= 300);
        assert!(metrics.wall_time_ms < 5000);
        assert!(metrics.killed);
        ctx.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_piped_stdio() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let root = tempfile::tempdir().unwrap();
        let manager = local_manager(root.path(), 1);
        let mut ctx = manager.create_context().await.unwrap();

        let mut handle = ctx.run("tr a-z A-Z", Stdin::Pipe, None).await.unwrap();
        let mut stdin = handle.take_stdin().unwrap();
        let mut stdout = handle.take_stdout().unwrap();

        stdin.write_all(b"hello\n").await.unwrap();
        drop(stdin);
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "HELLO\n");
        assert!(handle.wait().await.unwrap().is_success());
        ctx.destroy().await.unwrap();
    }
}
