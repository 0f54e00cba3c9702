//! In-memory gatherer that records every event

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use super::{ResultGatherer, SystemInfo};
use crate::core::verdict::Verdict;
use crate::sandbox::RuntimeData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartEvaluation(SystemInfo),
    StartCompilation,
    FinishCompilation(Option<RuntimeData>),
    StartTesting,
    ReachTest {
        id: i64,
        input: Option<String>,
        answer: Option<String>,
    },
    IgnoreTest {
        id: i64,
    },
    FinishTest {
        id: i64,
        verdict: Verdict,
        submission: Option<RuntimeData>,
        checker: Option<RuntimeData>,
    },
    FinishTesting,
    FinishEvaluation {
        error: Option<String>,
        is_compile_error: bool,
        is_internal_error: bool,
    },
}

#[derive(Debug, Default)]
pub struct MemoryGatherer {
    events: Mutex<Vec<Event>>,
}

impl MemoryGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl ResultGatherer for MemoryGatherer {
    async fn start_evaluation(&self, info: &SystemInfo) {
        self.push(Event::StartEvaluation(info.clone()));
    }

    async fn start_compilation(&self) {
        self.push(Event::StartCompilation);
    }

    async fn finish_compilation(&self, runtime: Option<&RuntimeData>) {
        self.push(Event::FinishCompilation(runtime.cloned()));
    }

    async fn start_testing(&self) {
        self.push(Event::StartTesting);
    }

    async fn reach_test(&self, test_id: i64, input: Option<&str>, answer: Option<&str>) {
        self.push(Event::ReachTest {
            id: test_id,
            input: input.map(String::from),
            answer: answer.map(String::from),
        });
    }

    async fn ignore_test(&self, test_id: i64) {
        self.push(Event::IgnoreTest { id: test_id });
    }

    async fn finish_test(
        &self,
        test_id: i64,
        verdict: Verdict,
        submission: Option<&RuntimeData>,
        checker: Option<&RuntimeData>,
    ) {
        self.push(Event::FinishTest {
            id: test_id,
            verdict,
            submission: submission.cloned(),
            checker: checker.cloned(),
        });
    }

    async fn finish_testing(&self) {
        self.push(Event::FinishTesting);
    }

    async fn finish_evaluation(
        &self,
        error: Option<&str>,
        is_compile_error: bool,
        is_internal_error: bool,
    ) {
        self.push(Event::FinishEvaluation {
            error: error.map(String::from),
            is_compile_error,
            is_internal_error,
        });
    }
}
