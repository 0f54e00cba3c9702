//! Judger module - evaluation orchestration
//!
//! Drives one [`EvaluationRequest`] through compilation and testing:
//!
//! 1. Fan out test data scheduling, submission compilation and
//!    checker/interactor compilation. A failing branch cancels the others
//!    before they start new sandbox work.
//! 2. Run the tests (optionally several at once) and report them to the
//!    gatherer strictly in request order.
//! 3. Emit exactly one terminal `finish_evaluation`.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checker::{
    compare_output, judge_checker_run, run_checker, run_interactive, CompiledProgram,
};
use crate::compiler::{compile_error_message, compile_in_sandbox, CompileCache, CompileOutcome};
use crate::config::JudgeConfig;
use crate::core::outcome::{EvaluationOutcome, EvaluationStatus, TestOutcome};
use crate::core::request::{EvaluationRequest, Program, TestCase};
use crate::core::utils::truncate_preview;
use crate::core::verdict::Verdict;
use crate::gatherer::{ResultGatherer, SystemInfo};
use crate::sandbox::{
    ProcessMetrics, RuntimeConstraints, RuntimeData, SandboxManager, SandboxStatus, Stdin,
    STDOUT_FILE,
};
use crate::storage::{ArtifactStore, ContentSource};

/// Why an evaluation stopped early
enum Failure {
    /// The submission did not compile
    Compile(String),
    /// Something the judge relies on broke
    Internal(anyhow::Error),
}

/// Outcome of one compile fan-out branch
enum BranchError {
    Cancelled,
    Rejected(RuntimeData),
    Infra(anyhow::Error),
}

/// Everything the test phase needs
struct Prepared {
    submission: CompiledProgram,
    checker: Option<CompiledProgram>,
    interactor: Option<CompiledProgram>,
    /// Store keys of (input, answer) per test, in request order
    data_keys: Vec<(String, String)>,
}

/// A test that ran to a verdict
struct FinishedTest {
    input_preview: String,
    answer_preview: String,
    verdict: Verdict,
    submission: RuntimeData,
    checker: Option<RuntimeData>,
}

enum TestRun {
    Finished(Box<FinishedTest>),
    /// Another test already stopped the evaluation
    Skipped,
}

/// Classify a submission run against its limits.
///
/// `Ok(None)` means the run was clean and its output should be checked.
pub fn classify_run(
    metrics: &ProcessMetrics,
    limits: &RuntimeConstraints,
) -> Result<Option<Verdict>> {
    if metrics.status == SandboxStatus::InternalError {
        anyhow::bail!(
            "Sandbox failure: {}",
            metrics.message.as_deref().unwrap_or("unknown error")
        );
    }

    let timed_out = metrics.status == SandboxStatus::TimedOut;
    let verdict = if metrics.oom_killed || metrics.memory_kb > limits.memory_kb {
        Some(Verdict::MemoryLimitExceeded)
    } else if metrics.cpu_time_ms > limits.cpu_time_ms
        || (timed_out && metrics.cpu_time_ms >= limits.cpu_time_ms)
    {
        Some(Verdict::TimeLimitExceeded)
    } else if timed_out {
        Some(Verdict::IdlenessLimitExceeded)
    } else if matches!(
        metrics.status,
        SandboxStatus::Signalled | SandboxStatus::RuntimeError
    ) || metrics.exit_code != 0
    {
        Some(Verdict::RuntimeError)
    } else {
        None
    };
    Ok(verdict)
}

/// Evaluates submissions against shared sandbox, store and compile cache
pub struct Evaluator {
    sandbox: SandboxManager,
    store: Arc<ArtifactStore>,
    cache: Arc<CompileCache>,
    config: JudgeConfig,
}

impl Evaluator {
    pub fn new(
        config: JudgeConfig,
        sandbox: SandboxManager,
        store: Arc<ArtifactStore>,
        cache: Arc<CompileCache>,
    ) -> Self {
        Self {
            sandbox,
            store,
            cache,
            config,
        }
    }

    /// Build the sandbox manager, artifact store and compile cache from
    /// configuration. Must be called inside a tokio runtime.
    pub fn from_config(config: JudgeConfig, source: Arc<dyn ContentSource>) -> Self {
        let sandbox = SandboxManager::from_config(&config.sandbox);
        let store = Arc::new(ArtifactStore::from_config(&config.storage, source));
        let cache = Arc::new(CompileCache::from_config(&config.compile, sandbox.clone()));
        info!(
            "Evaluator ready: facility={}, boxes {}..{}, test concurrency {}",
            sandbox.facility_name(),
            config.sandbox.first_box_id,
            config.sandbox.first_box_id.saturating_add(config.sandbox.box_count),
            config.evaluation.test_concurrency
        );
        Self::new(config, sandbox, store, cache)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn compile_cache(&self) -> &CompileCache {
        &self.cache
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            facility: self.sandbox.facility_name().to_string(),
            box_count: self.config.sandbox.box_count,
            test_concurrency: self.config.evaluation.test_concurrency.max(1),
        }
    }

    /// Judge one submission, reporting progress to `gatherer`
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        gatherer: &dyn ResultGatherer,
    ) -> EvaluationOutcome {
        let started = Instant::now();
        info!(
            "Evaluating {} ({} tests, cpu {}ms, memory {}KB)",
            request.id,
            request.tests.len(),
            request.cpu_time_ms,
            request.memory_kb
        );
        gatherer.start_evaluation(&self.system_info()).await;

        let mut outcome = EvaluationOutcome::new(&request.id);
        let result = self.run_pipeline(request, gatherer, &mut outcome).await;

        match result {
            Ok(()) => {
                gatherer.finish_evaluation(None, false, false).await;
            }
            Err(Failure::Compile(message)) => {
                info!("Submission {} did not compile", request.id);
                outcome.status = EvaluationStatus::CompileError;
                gatherer.finish_evaluation(Some(message.as_str()), true, false).await;
                outcome.error = Some(message);
            }
            Err(Failure::Internal(e)) => {
                let message = format!("{:#}", e);
                error!("Evaluation {} failed: {}", request.id, message);
                outcome.status = EvaluationStatus::InternalError;
                gatherer.finish_evaluation(Some(message.as_str()), false, true).await;
                outcome.error = Some(message);
            }
        }

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        outcome.summarize();
        info!(
            "Evaluation {} done: {:?}, verdict {:?}, score {}/{}, {}ms",
            request.id,
            outcome.status,
            outcome.verdict(),
            outcome.score.earned,
            outcome.score.total,
            outcome.elapsed_ms
        );
        outcome
    }

    async fn run_pipeline(
        &self,
        request: &EvaluationRequest,
        gatherer: &dyn ResultGatherer,
        outcome: &mut EvaluationOutcome,
    ) -> Result<(), Failure> {
        gatherer.start_compilation().await;
        let (runtime, prepared) = self.compile_phase(request).await;
        gatherer.finish_compilation(runtime.as_ref()).await;
        let prepared = prepared?;

        gatherer.start_testing().await;
        let result = self
            .test_phase(request, &prepared, gatherer, outcome)
            .await;
        gatherer.finish_testing().await;
        result.map_err(Failure::Internal)
    }

    /// Compile fan-out. Returns the submission compiler run (if any) and the
    /// prepared programs.
    async fn compile_phase(
        &self,
        request: &EvaluationRequest,
    ) -> (Option<RuntimeData>, Result<Prepared, Failure>) {
        if request.interactor.is_some() && self.sandbox.box_count() < 2 {
            let error = anyhow::anyhow!(
                "Interactive problems need at least 2 sandboxes, the pool has {}",
                self.sandbox.box_count()
            );
            return (None, Err(Failure::Internal(error)));
        }

        let token = CancellationToken::new();

        let (data_keys, submission, helpers) = tokio::join!(
            self.schedule_tests(request, &token),
            self.compile_submission(request, &token),
            self.compile_helpers(request, &token),
        );

        let runtime = match &submission {
            Ok(program) => program.artifact.runtime.clone(),
            Err(BranchError::Rejected(runtime)) => Some(runtime.clone()),
            Err(_) => None,
        };

        let prepared = match (submission, data_keys, helpers) {
            (Ok(submission), Ok(data_keys), Ok((checker, interactor))) => Ok(Prepared {
                submission,
                checker,
                interactor,
                data_keys,
            }),
            // The submission branch goes first so a rejected submission wins
            // over a sibling's infrastructure failure
            (submission, data_keys, helpers) => {
                let error = [submission.err(), data_keys.err(), helpers.err()]
                    .into_iter()
                    .flatten()
                    .find(|e| !matches!(e, BranchError::Cancelled))
                    .unwrap_or(BranchError::Cancelled);
                Err(branch_failure(error))
            }
        };
        (runtime, prepared)
    }

    async fn schedule_tests(
        &self,
        request: &EvaluationRequest,
        token: &CancellationToken,
    ) -> Result<Vec<(String, String)>, BranchError> {
        let schedule = || -> Result<Vec<(String, String)>> {
            let mut keys = Vec::with_capacity(request.tests.len());
            for test in &request.tests {
                let (input_key, input) = test
                    .input
                    .resolve()
                    .with_context(|| format!("Invalid input of test {}", test.id))?;
                let (answer_key, answer) = test
                    .answer
                    .resolve()
                    .with_context(|| format!("Invalid answer of test {}", test.id))?;
                self.store.schedule(&input_key, input)?;
                self.store.schedule(&answer_key, answer)?;
                keys.push((input_key, answer_key));
            }
            Ok(keys)
        };

        schedule().map_err(|e| {
            token.cancel();
            BranchError::Infra(e)
        })
    }

    async fn compile_submission(
        &self,
        request: &EvaluationRequest,
        token: &CancellationToken,
    ) -> Result<CompiledProgram, BranchError> {
        if token.is_cancelled() {
            return Err(BranchError::Cancelled);
        }

        let compiled = compile_in_sandbox(
            &self.sandbox,
            &request.language,
            &request.source,
            &self.config.compile.limits,
        )
        .await;

        match compiled {
            Ok(CompileOutcome::Compiled(artifact)) => Ok(CompiledProgram {
                language: request.language.clone(),
                artifact,
            }),
            Ok(CompileOutcome::Failed(runtime)) => {
                token.cancel();
                Err(BranchError::Rejected(runtime))
            }
            Err(e) => {
                token.cancel();
                Err(BranchError::Infra(e.context("Failed to compile submission")))
            }
        }
    }

    async fn compile_helpers(
        &self,
        request: &EvaluationRequest,
        token: &CancellationToken,
    ) -> Result<(Option<CompiledProgram>, Option<CompiledProgram>), BranchError> {
        let (checker, interactor) = tokio::join!(
            self.compile_helper("checker", request.checker.as_ref(), token),
            self.compile_helper("interactor", request.interactor.as_ref(), token),
        );
        match (checker, interactor) {
            (Ok(checker), Ok(interactor)) => Ok((checker, interactor)),
            (Err(BranchError::Cancelled), Err(e)) | (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    async fn compile_helper(
        &self,
        role: &str,
        program: Option<&Program>,
        token: &CancellationToken,
    ) -> Result<Option<CompiledProgram>, BranchError> {
        let Some(program) = program else {
            return Ok(None);
        };
        if token.is_cancelled() {
            return Err(BranchError::Cancelled);
        }

        let result = match self
            .cache
            .get_compiled(&program.source, &program.language)
            .await
        {
            Ok(CompileOutcome::Compiled(artifact)) => Ok(Some(CompiledProgram {
                language: program.language.clone(),
                artifact,
            })),
            Ok(CompileOutcome::Failed(runtime)) => Err(anyhow::anyhow!(
                "The {} failed to compile: {}",
                role,
                compile_error_message(&runtime)
            )),
            Err(e) => Err(e.context(format!("Failed to compile the {}", role))),
        };

        result.map_err(|e| {
            token.cancel();
            BranchError::Infra(e)
        })
    }

    async fn test_phase(
        &self,
        request: &EvaluationRequest,
        prepared: &Prepared,
        gatherer: &dyn ResultGatherer,
        outcome: &mut EvaluationOutcome,
    ) -> Result<()> {
        let token = CancellationToken::new();
        let limits = RuntimeConstraints::for_test(request.cpu_time_ms, request.memory_kb);
        let concurrency = self.config.evaluation.test_concurrency.max(1);
        let mut report = Report {
            request,
            gatherer,
            outcome,
            token: &token,
            fatal: None,
            stopped: false,
        };

        if concurrency == 1 {
            // One at a time: each test is reached before it runs
            for (test, keys) in request.tests.iter().zip(&prepared.data_keys) {
                if report.halted() {
                    report.ignore(test, false).await;
                    continue;
                }
                let (input, answer) = match self.load_test(keys).await {
                    Ok(data) => data,
                    Err(e) => {
                        report.record(test, Err(e), false).await;
                        continue;
                    }
                };
                let (input_preview, answer_preview) = previews(&input, &answer);
                gatherer
                    .reach_test(
                        test.id,
                        Some(input_preview.as_str()),
                        Some(answer_preview.as_str()),
                    )
                    .await;
                let run = self.finish_run(test, &input, &answer, prepared, &limits).await;
                report.record(test, run, true).await;
            }
        } else {
            let mut runs = stream::iter(0..request.tests.len())
                .map(|i| {
                    self.run_test(
                        &request.tests[i],
                        &prepared.data_keys[i],
                        prepared,
                        &limits,
                        &token,
                    )
                })
                .buffered(concurrency);

            let mut tests = request.tests.iter();
            while let Some(run) = runs.next().await {
                let Some(test) = tests.next() else { break };
                report.record(test, run, false).await;
            }
        }

        match report.fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn load_test(
        &self,
        (input_key, answer_key): &(String, String),
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let input = self.store.wait(input_key).await?;
        let answer = self.store.wait(answer_key).await?;
        Ok((input, answer))
    }

    async fn run_test(
        &self,
        test: &TestCase,
        keys: &(String, String),
        prepared: &Prepared,
        limits: &RuntimeConstraints,
        token: &CancellationToken,
    ) -> Result<TestRun> {
        if token.is_cancelled() {
            return Ok(TestRun::Skipped);
        }

        let (input, answer) = self.load_test(keys).await?;
        if token.is_cancelled() {
            return Ok(TestRun::Skipped);
        }
        self.finish_run(test, &input, &answer, prepared, limits).await
    }

    /// Execute one test whose data is loaded and classify it
    async fn finish_run(
        &self,
        test: &TestCase,
        input: &[u8],
        answer: &[u8],
        prepared: &Prepared,
        limits: &RuntimeConstraints,
    ) -> Result<TestRun> {
        debug!("Running test {} ({} input bytes)", test.id, input.len());
        let checker_limits = &self.config.evaluation.checker_limits;

        let (verdict, submission, checker) = match &prepared.interactor {
            Some(interactor) => {
                let run = run_interactive(
                    &self.sandbox,
                    &prepared.submission,
                    interactor,
                    input,
                    answer,
                    limits,
                    checker_limits,
                )
                .await?;

                match classify_run(&run.submission.metrics, limits)? {
                    Some(verdict) => (verdict, run.submission, Some(run.interactor)),
                    None => {
                        let verdict = judge_checker_run(&run.interactor)
                            .context("Interactor failed")?;
                        match (&prepared.checker, verdict) {
                            (Some(checker), Verdict::Accepted) => {
                                let report = run_checker(
                                    &self.sandbox,
                                    checker,
                                    input,
                                    &run.transcript,
                                    answer,
                                    checker_limits,
                                )
                                .await?;
                                (report.verdict, run.submission, Some(report.runtime))
                            }
                            _ => (verdict, run.submission, Some(run.interactor)),
                        }
                    }
                }
            }
            None => {
                let (submission, output) = self.run_submission(prepared, input, limits).await?;
                match classify_run(&submission.metrics, limits)? {
                    Some(verdict) => (verdict, submission, None),
                    None => match &prepared.checker {
                        Some(checker) => {
                            let report = run_checker(
                                &self.sandbox,
                                checker,
                                input,
                                &output,
                                answer,
                                checker_limits,
                            )
                            .await?;
                            (report.verdict, submission, Some(report.runtime))
                        }
                        None => {
                            let matches = compare_output(
                                &String::from_utf8_lossy(&output),
                                &String::from_utf8_lossy(answer),
                            );
                            let verdict = if matches {
                                Verdict::Accepted
                            } else {
                                Verdict::WrongAnswer
                            };
                            (verdict, submission, None)
                        }
                    },
                }
            }
        };

        let (input_preview, answer_preview) = previews(input, answer);
        Ok(TestRun::Finished(Box::new(FinishedTest {
            input_preview,
            answer_preview,
            verdict,
            submission,
            checker,
        })))
    }

    /// Run the submission in a fresh box; returns its runtime data and full stdout
    async fn run_submission(
        &self,
        prepared: &Prepared,
        input: &[u8],
        limits: &RuntimeConstraints,
    ) -> Result<(RuntimeData, Vec<u8>)> {
        let mut ctx = self.sandbox.create_context().await?;

        let result = async {
            prepared.submission.install(&ctx).await?;
            let runtime = ctx
                .run(
                    &prepared.submission.language.execute_command,
                    Stdin::Bytes(input.to_vec()),
                    Some(limits),
                )
                .await?
                .wait_with_output()
                .await?;
            let output = ctx.get_file(STDOUT_FILE).await.unwrap_or_default();
            Ok::<_, anyhow::Error>((runtime, output))
        }
        .await;

        let box_id = ctx.id();
        if let Err(e) = ctx.destroy().await {
            warn!("Failed to destroy test sandbox {}: {:#}", box_id, e);
        }
        result
    }
}

fn previews(input: &[u8], answer: &[u8]) -> (String, String) {
    (
        truncate_preview(&String::from_utf8_lossy(input)),
        truncate_preview(&String::from_utf8_lossy(answer)),
    )
}

/// Gatherer-facing side of the test phase
struct Report<'a> {
    request: &'a EvaluationRequest,
    gatherer: &'a dyn ResultGatherer,
    outcome: &'a mut EvaluationOutcome,
    token: &'a CancellationToken,
    fatal: Option<anyhow::Error>,
    stopped: bool,
}

impl Report<'_> {
    fn halted(&self) -> bool {
        self.fatal.is_some() || self.stopped
    }

    /// Record the result of `test`. `reached` is set when `reach_test` was
    /// already emitted for it.
    async fn record(&mut self, test: &TestCase, run: Result<TestRun>, reached: bool) {
        match run {
            Ok(TestRun::Finished(done)) if !self.halted() => {
                if !reached {
                    self.gatherer
                        .reach_test(
                            test.id,
                            Some(done.input_preview.as_str()),
                            Some(done.answer_preview.as_str()),
                        )
                        .await;
                }
                self.gatherer
                    .finish_test(
                        test.id,
                        done.verdict,
                        Some(&done.submission),
                        done.checker.as_ref(),
                    )
                    .await;

                if self.request.stop_on_failure && !done.verdict.is_accepted() {
                    info!(
                        "Stopping {} after test {} ({})",
                        self.request.id, test.id, done.verdict
                    );
                    self.stopped = true;
                    self.token.cancel();
                }
                let FinishedTest {
                    verdict,
                    submission,
                    checker,
                    ..
                } = *done;
                self.outcome
                    .tests
                    .push(TestOutcome::finished(test, verdict, submission, checker));
            }
            Err(e) if self.fatal.is_none() => {
                warn!(
                    "Test {} of {} hit an infrastructure failure",
                    test.id, self.request.id
                );
                self.token.cancel();
                self.fatal = Some(e.context(format!("Test {} failed", test.id)));
                self.ignore(test, reached).await;
            }
            Err(e) => {
                debug!("Discarding result of test {}: {:#}", test.id, e);
                self.ignore(test, reached).await;
            }
            _ => self.ignore(test, reached).await,
        }
    }

    async fn ignore(&mut self, test: &TestCase, reached: bool) {
        if !reached {
            self.gatherer.reach_test(test.id, None, None).await;
        }
        self.gatherer.ignore_test(test.id).await;
        self.outcome.tests.push(TestOutcome::ignored(test));
    }
}

fn branch_failure(error: BranchError) -> Failure {
    match error {
        BranchError::Rejected(runtime) => Failure::Compile(compile_error_message(&runtime)),
        BranchError::Infra(e) => Failure::Internal(e),
        BranchError::Cancelled => {
            Failure::Internal(anyhow::anyhow!("Compilation was cancelled"))
        }
    }
}
