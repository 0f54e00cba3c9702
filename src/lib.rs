//! Judge engine
//!
//! Compiles a submission inside a resource-limited sandbox, runs it against
//! every test, verifies the output with a checker, interactor or plain
//! comparison, and reports graded verdicts through a [`ResultGatherer`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use judge_engine::{Evaluator, JudgeConfig, LocalSource, LogGatherer};
//!
//! # async fn demo(request: judge_engine::EvaluationRequest) -> anyhow::Result<()> {
//! judge_engine::telemetry::init();
//! let config = JudgeConfig::from_env()?;
//! let evaluator = Evaluator::from_config(config, Arc::new(LocalSource::new()));
//! let outcome = evaluator
//!     .evaluate(&request, &LogGatherer::new(&request.id))
//!     .await;
//! println!("{:?}", outcome.verdict());
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod compiler;
pub mod config;
pub mod core;
pub mod gatherer;
pub mod judger;
pub mod sandbox;
pub mod storage;
pub mod telemetry;

pub use crate::config::JudgeConfig;
pub use crate::core::{
    ContentRef, EvaluationOutcome, EvaluationRequest, EvaluationStatus, Language, Program,
    Score, TestCase, TestOutcome, Verdict,
};
pub use gatherer::{Event, LogGatherer, MemoryGatherer, ResultGatherer, SystemInfo};
pub use judger::Evaluator;
pub use storage::{ArtifactStore, ContentSource, LocalSource, Locator, StorageClient};
