//! Evaluation results and scoring

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::request::TestCase;
use crate::core::verdict::Verdict;
use crate::sandbox::RuntimeData;

/// How the evaluation as a whole ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    /// Every test has a verdict (possibly Ignored after stop-on-failure)
    Success,
    CompileError,
    InternalError,
}

/// Result of one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub id: i64,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<RuntimeData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<RuntimeData>,
}

impl TestOutcome {
    pub fn finished(
        test: &TestCase,
        verdict: Verdict,
        submission: RuntimeData,
        checker: Option<RuntimeData>,
    ) -> Self {
        Self {
            id: test.id,
            verdict,
            group: test.group.clone(),
            points: test.points,
            submission: Some(submission),
            checker,
        }
    }

    pub fn ignored(test: &TestCase) -> Self {
        Self {
            id: test.id,
            verdict: Verdict::Ignored,
            group: test.group.clone(),
            points: test.points,
            submission: None,
            checker: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub earned: u32,
    pub total: u32,
}

/// Score a list of test results.
///
/// Ungrouped tests earn their own points. Tests sharing a group earn the
/// group's points only when every one of them is accepted.
pub fn score(tests: &[TestOutcome]) -> Score {
    let mut earned = 0;
    let mut total = 0;
    let mut groups: BTreeMap<&str, (u32, bool)> = BTreeMap::new();

    for test in tests {
        total += test.points;
        let accepted = test.verdict.is_accepted();
        match &test.group {
            None if accepted => earned += test.points,
            None => {}
            Some(group) => {
                let entry = groups.entry(group.as_str()).or_insert((0, true));
                entry.0 += test.points;
                entry.1 &= accepted;
            }
        }
    }

    earned += groups
        .values()
        .filter(|(_, all_accepted)| *all_accepted)
        .map(|(points, _)| points)
        .sum::<u32>();

    Score { earned, total }
}

/// Final result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub id: String,
    pub status: EvaluationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tests: Vec<TestOutcome>,
    /// Largest cpu time among finished tests
    pub max_cpu_time_ms: u64,
    /// Largest peak memory among finished tests
    pub max_memory_kb: u64,
    /// Wall time of the whole evaluation
    pub elapsed_ms: u64,
    pub score: Score,
}

impl EvaluationOutcome {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: EvaluationStatus::Success,
            error: None,
            tests: Vec::new(),
            max_cpu_time_ms: 0,
            max_memory_kb: 0,
            elapsed_ms: 0,
            score: Score::default(),
        }
    }

    /// First verdict that is neither Accepted nor Ignored, or Accepted
    pub fn verdict(&self) -> Option<Verdict> {
        if self.status != EvaluationStatus::Success {
            return None;
        }
        Some(
            self.tests
                .iter()
                .map(|t| t.verdict)
                .find(|v| !matches!(v, Verdict::Accepted | Verdict::Ignored))
                .unwrap_or(Verdict::Accepted),
        )
    }

    /// Recompute aggregate timing and score from the test list
    pub fn summarize(&mut self) {
        let runs = self.tests.iter().filter_map(|t| t.submission.as_ref());
        let (cpu, memory) = runs.fold((0, 0), |(cpu, memory), run| {
            (
                cpu.max(run.metrics.cpu_time_ms),
                memory.max(run.metrics.memory_kb),
            )
        });
        self.max_cpu_time_ms = cpu;
        self.max_memory_kb = memory;
        self.score = score(&self.tests);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ProcessMetrics;

    fn outcome(id: i64, verdict: Verdict, group: Option<&str>, points: u32) -> TestOutcome {
        TestOutcome {
            id,
            verdict,
            group: group.map(String::from),
            points,
            submission: None,
            checker: None,
        }
    }

    #[test]
    fn test_ungrouped_tests_are_additive() {
        let tests = vec![
            outcome(1, Verdict::Accepted, None, 10),
            outcome(2, Verdict::WrongAnswer, None, 20),
            outcome(3, Verdict::Accepted, None, 30),
        ];
        assert_eq!(score(&tests), Score { earned: 40, total: 60 });
    }

    #[test]
    fn test_groups_are_all_or_nothing() {
        let tests = vec![
            outcome(1, Verdict::Accepted, Some("easy"), 5),
            outcome(2, Verdict::Accepted, Some("easy"), 5),
            outcome(3, Verdict::Accepted, Some("hard"), 20),
            outcome(4, Verdict::TimeLimitExceeded, Some("hard"), 20),
            outcome(5, Verdict::Accepted, None, 1),
        ];
        assert_eq!(score(&tests), Score { earned: 11, total: 51 });
    }

    #[test]
    fn test_ignored_tests_score_zero() {
        let tests = vec![
            outcome(1, Verdict::Accepted, Some("g"), 3),
            outcome(2, Verdict::Ignored, Some("g"), 3),
            outcome(3, Verdict::Ignored, None, 4),
        ];
        assert_eq!(score(&tests), Score { earned: 0, total: 10 });
    }

    #[test]
    fn test_summarize_and_overall_verdict() {
        let run = |cpu, memory| RuntimeData {
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            metrics: ProcessMetrics {
                cpu_time_ms: cpu,
                memory_kb: memory,
                ..Default::default()
            },
        };

        let mut result = EvaluationOutcome::new("sub-1");
        result.tests = vec![
            TestOutcome {
                submission: Some(run(120, 2048)),
                ..outcome(1, Verdict::Accepted, None, 1)
            },
            TestOutcome {
                submission: Some(run(80, 4096)),
                ..outcome(2, Verdict::RuntimeError, None, 1)
            },
            outcome(3, Verdict::Ignored, None, 1),
        ];
        result.summarize();

        assert_eq!(result.max_cpu_time_ms, 120);
        assert_eq!(result.max_memory_kb, 4096);
        assert_eq!(result.score, Score { earned: 1, total: 3 });
        assert_eq!(result.verdict(), Some(Verdict::RuntimeError));
    }
}
