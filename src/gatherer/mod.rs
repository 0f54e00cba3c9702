//! Result gatherer - the only way progress leaves an evaluation
//!
//! The evaluator reports every step to a [`ResultGatherer`]. Transports (queues,
//! websockets, databases) implement this trait outside the crate; the crate
//! ships an in-memory recorder and a tracing logger.

pub mod log;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::verdict::Verdict;
use crate::sandbox::RuntimeData;

pub use self::log::LogGatherer;
pub use memory::{Event, MemoryGatherer};

/// Description of the judging host sent with `start_evaluation`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    /// Isolation facility in use ("isolate" or "local")
    pub facility: String,
    pub box_count: u32,
    pub test_concurrency: usize,
}

/// Receiver of evaluation progress events, in emission order
#[async_trait]
pub trait ResultGatherer: Send + Sync {
    async fn start_evaluation(&self, info: &SystemInfo);

    async fn start_compilation(&self);

    /// Submission compiler run; `None` for interpreted languages or when
    /// compilation never started
    async fn finish_compilation(&self, runtime: Option<&RuntimeData>);

    async fn start_testing(&self);

    /// Previews are cut to 40 lines x 80 columns; `None` when the data was
    /// never fetched
    async fn reach_test(&self, test_id: i64, input: Option<&str>, answer: Option<&str>);

    async fn ignore_test(&self, test_id: i64);

    async fn finish_test(
        &self,
        test_id: i64,
        verdict: Verdict,
        submission: Option<&RuntimeData>,
        checker: Option<&RuntimeData>,
    );

    async fn finish_testing(&self);

    /// Terminal event, sent exactly once
    async fn finish_evaluation(
        &self,
        error: Option<&str>,
        is_compile_error: bool,
        is_internal_error: bool,
    );
}
