//! Gatherer that writes progress to the tracing log

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{ResultGatherer, SystemInfo};
use crate::core::utils::truncate_preview;
use crate::core::verdict::Verdict;
use crate::sandbox::RuntimeData;

/// Logs every event under the evaluation id
#[derive(Debug, Clone)]
pub struct LogGatherer {
    evaluation_id: String,
}

impl LogGatherer {
    pub fn new(evaluation_id: impl Into<String>) -> Self {
        Self {
            evaluation_id: evaluation_id.into(),
        }
    }
}

#[async_trait]
impl ResultGatherer for LogGatherer {
    async fn start_evaluation(&self, info: &SystemInfo) {
        info!(
            "[{}] Evaluation started (judge {}, facility {}, {} boxes)",
            self.evaluation_id, info.version, info.facility, info.box_count
        );
    }

    async fn start_compilation(&self) {
        info!("[{}] Compiling", self.evaluation_id);
    }

    async fn finish_compilation(&self, runtime: Option<&RuntimeData>) {
        match runtime {
            Some(runtime) => info!(
                "[{}] Compilation finished: exit={} time={}ms",
                self.evaluation_id, runtime.metrics.exit_code, runtime.metrics.cpu_time_ms
            ),
            None => info!("[{}] Compilation finished", self.evaluation_id),
        }
    }

    async fn start_testing(&self) {
        info!("[{}] Testing", self.evaluation_id);
    }

    async fn reach_test(&self, test_id: i64, input: Option<&str>, answer: Option<&str>) {
        debug!(
            "[{}] Test {} input:\n{}\nanswer:\n{}",
            self.evaluation_id,
            test_id,
            truncate_preview(input.unwrap_or_default()),
            truncate_preview(answer.unwrap_or_default())
        );
    }

    async fn ignore_test(&self, test_id: i64) {
        info!("[{}] Test {}: ignored", self.evaluation_id, test_id);
    }

    async fn finish_test(
        &self,
        test_id: i64,
        verdict: Verdict,
        submission: Option<&RuntimeData>,
        _checker: Option<&RuntimeData>,
    ) {
        match submission {
            Some(run) => info!(
                "[{}] Test {}: {} (time={}ms, memory={}KB, exit={})",
                self.evaluation_id,
                test_id,
                verdict,
                run.metrics.cpu_time_ms,
                run.metrics.memory_kb,
                run.metrics.exit_code
            ),
            None => info!("[{}] Test {}: {}", self.evaluation_id, test_id, verdict),
        }
        if let Some(run) = submission.filter(|_| !verdict.is_accepted()) {
            debug!(
                "[{}] Test {} stdout:\n{}",
                self.evaluation_id,
                test_id,
                truncate_preview(&run.stdout)
            );
        }
    }

    async fn finish_testing(&self) {
        info!("[{}] Testing finished", self.evaluation_id);
    }

    async fn finish_evaluation(
        &self,
        error: Option<&str>,
        is_compile_error: bool,
        is_internal_error: bool,
    ) {
        if is_internal_error {
            error!(
                "[{}] Evaluation failed: {}",
                self.evaluation_id,
                error.unwrap_or("unknown error")
            );
        } else if is_compile_error {
            info!(
                "[{}] Compile error:\n{}",
                self.evaluation_id,
                truncate_preview(error.unwrap_or_default())
            );
        } else {
            info!("[{}] Evaluation finished", self.evaluation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_gatherer_accepts_every_event() {
        let gatherer = LogGatherer::new("sub-1");
        let info = SystemInfo {
            version: "0.1.0".into(),
            facility: "local".into(),
            box_count: 1,
            test_concurrency: 1,
        };
        gatherer.start_evaluation(&info).await;
        gatherer.start_compilation().await;
        gatherer.finish_compilation(None).await;
        gatherer.start_testing().await;
        gatherer.reach_test(1, Some("1 2\n"), None).await;
        gatherer
            .finish_test(1, Verdict::WrongAnswer, None, None)
            .await;
        gatherer.ignore_test(2).await;
        gatherer.finish_testing().await;
        gatherer.finish_evaluation(None, false, false).await;
    }
}
