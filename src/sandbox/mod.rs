//! Sandbox module - isolated execution contexts
//!
//! This module provides a minimal abstraction over an external isolation
//! facility. It handles:
//! - Box id allocation from a bounded pool
//! - Box initialization and cleanup
//! - File injection and retrieval
//! - Raw command execution returning `ProcessMetrics`
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judger's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod isolate;
pub mod limits;
pub mod local;
pub mod manager;
pub mod meta;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Child;

pub use isolate::IsolateFacility;
pub use limits::RuntimeConstraints;
pub use local::LocalFacility;
pub use manager::{
    ContextState, ProcessHandle, SandboxContext, SandboxError, SandboxManager, Stdin,
};
pub use meta::{parse_meta, ProcessMetrics, RuntimeData, SandboxStatus};

/// File inside the box that receives the program's stdin
pub const STDIN_FILE: &str = ".stdin";
/// File inside the box that receives the program's stdout
pub const STDOUT_FILE: &str = ".stdout";
/// File inside the box that receives the program's stderr
pub const STDERR_FILE: &str = ".stderr";

/// One command to execute inside an initialized box
#[derive(Debug, Clone)]
pub struct Invocation {
    pub box_id: u32,
    /// Host path of the box working directory
    pub work_dir: PathBuf,
    /// Shell command, run through `/bin/sh -c`
    pub command: String,
    /// Box-relative stdin file; `None` means empty stdin (or a pipe when `piped`)
    pub stdin_file: Option<String>,
    /// Box-relative stdout file; `None` only when `piped`
    pub stdout_file: Option<String>,
    pub stderr_file: String,
    /// stdin/stdout are connected to the caller through pipes
    pub piped: bool,
    pub constraints: RuntimeConstraints,
    /// Where the facility writes its result record
    pub meta_path: PathBuf,
}

/// An external process-isolation facility
#[async_trait]
pub trait Isolation: Send + Sync {
    /// Short name for logs and system info
    fn name(&self) -> &'static str;

    /// Force-clean any stale box with this id, create a fresh one and return
    /// its working directory
    async fn init(&self, box_id: u32) -> Result<PathBuf>;

    /// Destroy the box
    async fn cleanup(&self, box_id: u32) -> Result<()>;

    /// Start the invocation without waiting for it
    fn spawn(&self, invocation: &Invocation) -> Result<Child>;

    /// Wait for a spawned invocation and return its result record
    async fn finish(
        &self,
        invocation: &Invocation,
        child: Child,
        started: Instant,
    ) -> Result<String>;
}
