//! Compiler module - Source code compilation
//!
//! This module provides compilation functionality:
//! - Submission compilation (always in a fresh sandbox, never cached)
//! - Cached compilation of checkers and interactors ([`CompileCache`])
//!
//! A compiler that exits non-zero is a user error reported as
//! [`CompileOutcome::Failed`]; only infrastructure problems are `Err`.

pub mod cache;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::request::Language;
use crate::sandbox::{
    RuntimeConstraints, RuntimeData, SandboxContext, SandboxManager, SandboxStatus, Stdin,
};

pub use cache::{CacheStats, CompileCache};

/// A runnable program: the file the execute command expects, and its bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Compiler run that produced it; `None` for interpreted languages
    pub runtime: Option<RuntimeData>,
}

/// Result of a compilation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled(Artifact),
    /// The compiler rejected the source
    Failed(RuntimeData),
}

impl CompileOutcome {
    pub fn runtime(&self) -> Option<&RuntimeData> {
        match self {
            CompileOutcome::Compiled(artifact) => artifact.runtime.as_ref(),
            CompileOutcome::Failed(runtime) => Some(runtime),
        }
    }
}

/// Human readable reason for a failed compilation
pub fn compile_error_message(runtime: &RuntimeData) -> String {
    if !runtime.stderr.trim().is_empty() {
        return runtime.stderr.clone();
    }
    if !runtime.stdout.trim().is_empty() {
        return runtime.stdout.clone();
    }
    match runtime.metrics.status {
        SandboxStatus::TimedOut => "Compilation timed out".to_string(),
        SandboxStatus::Signalled => "Compiler crashed".to_string(),
        _ => format!(
            "Compilation failed with exit code {}",
            runtime.metrics.exit_code
        ),
    }
}

/// Compile `source` inside a fresh sandbox
pub async fn compile_in_sandbox(
    sandbox: &SandboxManager,
    language: &Language,
    source: &str,
    constraints: &RuntimeConstraints,
) -> Result<CompileOutcome> {
    let Some(command) = &language.compile_command else {
        // Interpreted language, no compilation needed
        return Ok(CompileOutcome::Compiled(Artifact {
            file_name: language.source_file.clone(),
            bytes: source.as_bytes().to_vec(),
            runtime: None,
        }));
    };

    let mut ctx = sandbox.create_context().await?;
    let result = compile_in(&mut ctx, language, command, source, constraints).await;
    let box_id = ctx.id();
    if let Err(e) = ctx.destroy().await {
        warn!("Failed to destroy compile sandbox {}: {:#}", box_id, e);
    }
    result
}

async fn compile_in(
    ctx: &mut SandboxContext,
    language: &Language,
    command: &str,
    source: &str,
    constraints: &RuntimeConstraints,
) -> Result<CompileOutcome> {
    ctx.add_file(&language.source_file, source.as_bytes()).await?;

    debug!("Compiling with {:?} in sandbox {}", command, ctx.id());
    let runtime = ctx
        .run(command, Stdin::Empty, Some(constraints))
        .await?
        .wait_with_output()
        .await
        .context("Failed to run compiler")?;

    if runtime.metrics.status == SandboxStatus::InternalError {
        anyhow::bail!(
            "Sandbox failure while compiling: {}",
            runtime.metrics.message.as_deref().unwrap_or("unknown error")
        );
    }

    if !runtime.metrics.is_success() {
        info!(
            "Compilation failed in sandbox {} ({:?}, exit code {})",
            ctx.id(),
            runtime.metrics.status,
            runtime.metrics.exit_code
        );
        return Ok(CompileOutcome::Failed(runtime));
    }

    let file_name = language.artifact_file().to_string();
    let bytes = ctx.get_file(&file_name).await.with_context(|| {
        format!(
            "Compiler exited successfully but did not produce {}",
            file_name
        )
    })?;

    Ok(CompileOutcome::Compiled(Artifact {
        file_name,
        bytes,
        runtime: Some(runtime),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FacilityKind, SandboxConfig};
    use crate::sandbox::ProcessMetrics;

    fn local_sandbox(root: &std::path::Path) -> SandboxManager {
        SandboxManager::from_config(&SandboxConfig {
            facility: FacilityKind::Local,
            local_root: root.to_path_buf(),
            box_count: 2,
            ..SandboxConfig::default()
        })
    }

    fn shell_language(compile: &str) -> Language {
        Language {
            source_file: "main.sh".into(),
            compile_command: Some(compile.into()),
            compiled_file: Some("main.bin".into()),
            execute_command: "sh main.bin".into(),
        }
    }

    #[tokio::test]
    async fn test_interpreted_language_skips_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path());
        let language = Language {
            source_file: "main.py".into(),
            compile_command: None,
            compiled_file: None,
            execute_command: "python3 main.py".into(),
        };

        let outcome = compile_in_sandbox(&sandbox, &language, "print(1)", &Default::default())
            .await
            .unwrap();
        match outcome {
            CompileOutcome::Compiled(artifact) => {
                assert_eq!(artifact.file_name, "main.py");
                assert_eq!(artifact.bytes, b"print(1)");
                assert!(artifact.runtime.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(sandbox.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_successful_compile_returns_artifact() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path());
        let language = shell_language("sh -n main.sh && cp main.sh main.bin");

        let outcome = compile_in_sandbox(&sandbox, &language, "echo hi\n", &Default::default())
            .await
            .unwrap();
        let CompileOutcome::Compiled(artifact) = outcome else {
            panic!("expected a compiled artifact");
        };
        assert_eq!(artifact.file_name, "main.bin");
        assert_eq!(artifact.bytes, b"echo hi\n");
        assert!(artifact.runtime.unwrap().metrics.is_success());
    }

    #[tokio::test]
    async fn test_compiler_error_is_an_outcome() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path());
        let language = shell_language("sh -n main.sh && cp main.sh main.bin");

        let outcome = compile_in_sandbox(&sandbox, &language, "if then fi (\n", &Default::default())
            .await
            .unwrap();
        let CompileOutcome::Failed(runtime) = outcome else {
            panic!("expected a compile failure");
        };
        assert_ne!(runtime.metrics.exit_code, 0);
        assert!(!compile_error_message(&runtime).is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path());
        let language = shell_language("true");

        let result = compile_in_sandbox(&sandbox, &language, "echo hi\n", &Default::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_compile_error_message_fallbacks() {
        let mut runtime = RuntimeData {
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            metrics: ProcessMetrics {
                exit_code: 2,
                status: SandboxStatus::RuntimeError,
                ..Default::default()
            },
        };
        assert_eq!(
            compile_error_message(&runtime),
            "Compilation failed with exit code 2"
        );

        runtime.metrics.status = SandboxStatus::TimedOut;
        assert_eq!(compile_error_message(&runtime), "Compilation timed out");

        runtime.stdout = "error: expected ';'".into();
        assert_eq!(compile_error_message(&runtime), "error: expected ';'");
    }
}
