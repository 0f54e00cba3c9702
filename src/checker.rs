//! Checker module - output verification
//!
//! This module handles:
//! - testlib.h exit code interpretation
//! - Running a compiled checker against one test
//! - Default whitespace-tolerant comparison when no checker is given
//! - Interactive runs (submission and interactor talking over pipes)

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::compiler::Artifact;
use crate::core::request::Language;
use crate::core::verdict::Verdict;
use crate::sandbox::{
    RuntimeConstraints, RuntimeData, SandboxContext, SandboxManager, SandboxStatus, Stdin,
};

pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_FILE: &str = "output.txt";
pub const ANSWER_FILE: &str = "answer.txt";

/// testlib.h exit codes
/// Reference: https://github.com/MikeMirzayanov/testlib
mod testlib_exit_codes {
    pub const OK: i32 = 0; // _ok
    pub const WRONG_ANSWER: i32 = 1; // _wa
    pub const PRESENTATION_ERROR: i32 = 2; // _pe
    pub const FAIL: i32 = 3; // _fail (checker bug or internal error)
    pub const DIRT: i32 = 4; // _dirt (extra output in user file)
    pub const UNEXPECTED_EOF: i32 = 8; // _unexpected_eof
}

/// The checker or interactor could not produce a verdict
#[derive(Debug, thiserror::Error)]
pub enum CheckerFailure {
    #[error("checker reported failure: {0}")]
    Fail(String),
    #[error("checker did not finish ({status:?}): {message}")]
    Crashed {
        status: SandboxStatus,
        message: String,
    },
}

/// A compiled program together with the language that runs it
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub language: Language,
    pub artifact: Artifact,
}

impl CompiledProgram {
    /// Copy the program into a sandbox
    pub async fn install(&self, ctx: &SandboxContext) -> Result<()> {
        ctx.add_executable(&self.artifact.file_name, &self.artifact.bytes)
            .await
    }

    /// Execute command with testlib's `input output answer` arguments
    fn testlib_command(&self) -> String {
        format!(
            "{} {} {} {}",
            self.language.execute_command, INPUT_FILE, OUTPUT_FILE, ANSWER_FILE
        )
    }
}

/// Verdict of one checker run
#[derive(Debug, Clone)]
pub struct CheckerReport {
    pub verdict: Verdict,
    pub runtime: RuntimeData,
}

/// Convert a testlib exit code to a verdict; `None` means the checker failed
pub fn exit_code_to_verdict(exit_code: i32) -> Option<Verdict> {
    match exit_code {
        testlib_exit_codes::OK => Some(Verdict::Accepted),
        testlib_exit_codes::WRONG_ANSWER
        | testlib_exit_codes::PRESENTATION_ERROR
        | testlib_exit_codes::DIRT
        | testlib_exit_codes::UNEXPECTED_EOF => Some(Verdict::WrongAnswer),
        testlib_exit_codes::FAIL => None,
        _ => {
            warn!("Unknown checker exit code: {}", exit_code);
            Some(Verdict::RuntimeError)
        }
    }
}

/// Interpret a finished checker or interactor run
pub fn judge_checker_run(runtime: &RuntimeData) -> Result<Verdict, CheckerFailure> {
    let metrics = &runtime.metrics;
    match metrics.status {
        SandboxStatus::Ok | SandboxStatus::RuntimeError => {
            exit_code_to_verdict(metrics.exit_code)
                .ok_or_else(|| CheckerFailure::Fail(runtime.diagnostics().trim().to_string()))
        }
        status => Err(CheckerFailure::Crashed {
            status,
            message: metrics
                .message
                .clone()
                .unwrap_or_else(|| runtime.diagnostics()),
        }),
    }
}

/// Compare outputs ignoring trailing whitespace on each line and trailing
/// empty lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

/// Run a testlib.h-based checker in a fresh sandbox
///
/// Arguments to checker: `input.txt output.txt answer.txt`
pub async fn run_checker(
    sandbox: &SandboxManager,
    checker: &CompiledProgram,
    input: &[u8],
    output: &[u8],
    answer: &[u8],
    limits: &RuntimeConstraints,
) -> Result<CheckerReport> {
    let mut ctx = sandbox.create_context().await?;
    let result = check_in(&mut ctx, checker, input, output, answer, limits).await;
    let box_id = ctx.id();
    if let Err(e) = ctx.destroy().await {
        warn!("Failed to destroy checker sandbox {}: {:#}", box_id, e);
    }

    let runtime = result?;
    debug!(
        "Checker result: exit_code={}, stderr={}",
        runtime.metrics.exit_code,
        runtime.stderr.chars().take(200).collect::<String>()
    );
    let verdict = judge_checker_run(&runtime)?;
    Ok(CheckerReport { verdict, runtime })
}

async fn check_in(
    ctx: &mut SandboxContext,
    checker: &CompiledProgram,
    input: &[u8],
    output: &[u8],
    answer: &[u8],
    limits: &RuntimeConstraints,
) -> Result<RuntimeData> {
    checker.install(ctx).await?;
    ctx.add_file(INPUT_FILE, input).await?;
    ctx.add_file(OUTPUT_FILE, output).await?;
    ctx.add_file(ANSWER_FILE, answer).await?;

    ctx.run(&checker.testlib_command(), Stdin::Empty, Some(limits))
        .await?
        .wait_with_output()
        .await
}

/// Both sides of an interactive run
#[derive(Debug, Clone)]
pub struct InteractiveRun {
    pub submission: RuntimeData,
    pub interactor: RuntimeData,
    /// What the interactor wrote to `output.txt`
    pub transcript: Vec<u8>,
}

/// Run the submission against an interactor.
///
/// The submission's stdout feeds the interactor's stdin and vice versa. The
/// interactor gets `input.txt output.txt answer.txt`.
pub async fn run_interactive(
    sandbox: &SandboxManager,
    submission: &CompiledProgram,
    interactor: &CompiledProgram,
    input: &[u8],
    answer: &[u8],
    submission_limits: &RuntimeConstraints,
    interactor_limits: &RuntimeConstraints,
) -> Result<InteractiveRun> {
    let mut contexts = sandbox.create_contexts(2).await?.into_iter();
    let (Some(mut sub_ctx), Some(mut int_ctx)) = (contexts.next(), contexts.next()) else {
        anyhow::bail!("Interactive run needs two sandboxes");
    };

    let result = interact_in(
        &mut sub_ctx,
        &mut int_ctx,
        submission,
        interactor,
        input,
        answer,
        submission_limits,
        interactor_limits,
    )
    .await;

    for ctx in [sub_ctx, int_ctx] {
        let box_id = ctx.id();
        if let Err(e) = ctx.destroy().await {
            warn!("Failed to destroy interactive sandbox {}: {:#}", box_id, e);
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn interact_in(
    sub_ctx: &mut SandboxContext,
    int_ctx: &mut SandboxContext,
    submission: &CompiledProgram,
    interactor: &CompiledProgram,
    input: &[u8],
    answer: &[u8],
    submission_limits: &RuntimeConstraints,
    interactor_limits: &RuntimeConstraints,
) -> Result<InteractiveRun> {
    submission.install(sub_ctx).await?;
    interactor.install(int_ctx).await?;
    int_ctx.add_file(INPUT_FILE, input).await?;
    int_ctx.add_file(ANSWER_FILE, answer).await?;

    let mut int_handle = int_ctx
        .run(&interactor.testlib_command(), Stdin::Pipe, Some(interactor_limits))
        .await?;
    let mut sub_handle = sub_ctx
        .run(
            &submission.language.execute_command,
            Stdin::Pipe,
            Some(submission_limits),
        )
        .await?;

    let pipes = (
        sub_handle.take_stdout(),
        int_handle.take_stdin(),
        int_handle.take_stdout(),
        sub_handle.take_stdin(),
    );
    let (Some(mut sub_out), Some(mut int_in), Some(mut int_out), Some(mut sub_in)) = pipes else {
        anyhow::bail!("Interactive run started without pipes");
    };

    // Broken pipes are expected when either side exits first
    let to_interactor = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut sub_out, &mut int_in).await;
        let _ = int_in.shutdown().await;
    });
    let to_submission = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut int_out, &mut sub_in).await;
        let _ = sub_in.shutdown().await;
    });

    let (sub_result, int_result) =
        tokio::join!(sub_handle.wait_with_output(), int_handle.wait_with_output());

    to_interactor.abort();
    to_submission.abort();

    let submission = sub_result?;
    let interactor = int_result?;
    let transcript = int_ctx.get_file(OUTPUT_FILE).await.unwrap_or_default();

    Ok(InteractiveRun {
        submission,
        interactor,
        transcript,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FacilityKind, SandboxConfig};
    use crate::sandbox::ProcessMetrics;

    fn local_sandbox(root: &std::path::Path, box_count: u32) -> SandboxManager {
        SandboxManager::from_config(&SandboxConfig {
            facility: FacilityKind::Local,
            local_root: root.to_path_buf(),
            box_count,
            ..SandboxConfig::default()
        })
    }

    fn shell_program(file_name: &str, script: &str) -> CompiledProgram {
        CompiledProgram {
            language: Language {
                source_file: file_name.into(),
                compile_command: None,
                compiled_file: None,
                execute_command: format!("sh {}", file_name),
            },
            artifact: Artifact {
                file_name: file_name.into(),
                bytes: script.as_bytes().to_vec(),
                runtime: None,
            },
        }
    }

    fn finished(status: SandboxStatus, exit_code: i32) -> RuntimeData {
        RuntimeData {
            stdout: String::new(),
            stderr: "checker message".into(),
            truncated: false,
            metrics: ProcessMetrics {
                exit_code,
                status,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_exit_code_to_verdict() {
        assert_eq!(exit_code_to_verdict(0), Some(Verdict::Accepted));
        assert_eq!(exit_code_to_verdict(1), Some(Verdict::WrongAnswer));
        assert_eq!(exit_code_to_verdict(2), Some(Verdict::WrongAnswer));
        assert_eq!(exit_code_to_verdict(3), None);
        assert_eq!(exit_code_to_verdict(4), Some(Verdict::WrongAnswer));
        assert_eq!(exit_code_to_verdict(8), Some(Verdict::WrongAnswer));
        assert_eq!(exit_code_to_verdict(42), Some(Verdict::RuntimeError));
    }

    #[test]
    fn test_judge_checker_run() {
        assert_eq!(
            judge_checker_run(&finished(SandboxStatus::RuntimeError, 1)).unwrap(),
            Verdict::WrongAnswer
        );
        assert!(matches!(
            judge_checker_run(&finished(SandboxStatus::RuntimeError, 3)),
            Err(CheckerFailure::Fail(msg)) if msg == "checker message"
        ));
        assert!(matches!(
            judge_checker_run(&finished(SandboxStatus::TimedOut, 0)),
            Err(CheckerFailure::Crashed { status: SandboxStatus::TimedOut, .. })
        ));
    }

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_whitespace() {
        assert!(compare_output("hello  \nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_newlines() {
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nWorld\n"));
        assert!(!compare_output("  hello\n", "hello\n"));
    }

    #[tokio::test]
    async fn test_run_checker_identity() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path(), 4);
        let checker = shell_program("check.sh", "cmp -s \"$2\" \"$3\" || exit 1\n");
        let limits = RuntimeConstraints::default();

        let report = run_checker(&sandbox, &checker, b"", b"42\n", b"42\n", &limits)
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::Accepted);

        let report = run_checker(&sandbox, &checker, b"", b"41\n", b"42\n", &limits)
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::WrongAnswer);
        assert_eq!(report.runtime.metrics.exit_code, 1);
        assert_eq!(sandbox.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_run_checker_fail_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path(), 4);
        let checker = shell_program("check.sh", "echo broken >&2; exit 3\n");

        let err = run_checker(&sandbox, &checker, b"", b"", b"", &Default::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckerFailure>(),
            Some(CheckerFailure::Fail(_))
        ));
    }

    #[tokio::test]
    async fn test_run_interactive_guessing_game() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path(), 4);

        // Reads the secret from input.txt, answers one guess
        let interactor = shell_program(
            "interactor.sh",
            "secret=$(cat \"$1\")\n\
             echo ready\n\
             read guess\n\
             echo \"guess $guess\" > \"$2\"\n\
             if [ \"$guess\" = \"$secret\" ]; then exit 0; else exit 1; fi\n",
        );
        let submission = shell_program("main.sh", "read line\necho 7\n");
        let limits = RuntimeConstraints::for_test(2000, 262144);

        let run = run_interactive(
            &sandbox,
            &submission,
            &interactor,
            b"7\n",
            b"",
            &limits,
            &limits,
        )
        .await
        .unwrap();

        assert!(run.submission.metrics.is_success());
        assert_eq!(judge_checker_run(&run.interactor).unwrap(), Verdict::Accepted);
        assert_eq!(run.transcript, b"guess 7\n");
        assert_eq!(sandbox.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_interactive_runs_share_a_small_pool() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path(), 2);
        let interactor = shell_program(
            "interactor.sh",
            "echo ping\nread reply\n[ \"$reply\" = pong ]\n",
        );
        let submission = shell_program("main.sh", "read line\nsleep 0.1\necho pong\n");
        let limits = RuntimeConstraints::for_test(2000, 262144);

        let runs = (0..3).map(|_| {
            run_interactive(
                &sandbox,
                &submission,
                &interactor,
                b"",
                b"",
                &limits,
                &limits,
            )
        });
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            futures::future::join_all(runs),
        )
        .await
        .expect("interactive runs deadlocked on the pool");

        for run in results {
            let run = run.unwrap();
            assert_eq!(judge_checker_run(&run.interactor).unwrap(), Verdict::Accepted);
        }
        assert_eq!(sandbox.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_interactive_run_needs_two_boxes() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(root.path(), 1);
        let program = shell_program("main.sh", "true\n");

        let err = run_interactive(
            &sandbox,
            &program,
            &program,
            b"",
            b"",
            &Default::default(),
            &Default::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("pool only has 1"));
        assert_eq!(sandbox.live_contexts(), 0);
    }
}
