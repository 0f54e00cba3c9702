#![allow(dead_code)]

use std::sync::Arc;

use judge_engine::config::FacilityKind;
use judge_engine::{
    ContentRef, EvaluationRequest, Evaluator, Event, JudgeConfig, Language, LocalSource,
    Program, TestCase,
};
use tempfile::TempDir;

/// Evaluator on the local facility, rooted in a temp dir
pub struct Harness {
    pub evaluator: Evaluator,
    pub dir: TempDir,
}

pub fn harness(test_concurrency: usize) -> Harness {
    harness_with(8, test_concurrency)
}

pub fn harness_with(box_count: u32, test_concurrency: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = JudgeConfig::default();
    config.sandbox.facility = FacilityKind::Local;
    config.sandbox.local_root = dir.path().join("boxes");
    config.sandbox.box_count = box_count;
    config.storage.cache_dir = dir.path().join("artifacts");
    config.compile.cache_dir = dir.path().join("compiled");
    config.compile.limits.wall_time_ms = 10_000;
    config.evaluation.test_concurrency = test_concurrency;

    let evaluator = Evaluator::from_config(config, Arc::new(LocalSource::new()));
    Harness { evaluator, dir }
}

/// Shell scripts, "compiled" by a syntax check and a copy
pub fn shell() -> Language {
    Language {
        source_file: "main.sh".into(),
        compile_command: Some("sh -n main.sh && cp main.sh main".into()),
        compiled_file: Some("main".into()),
        execute_command: "sh main".into(),
    }
}

pub fn shell_program(name: &str, source: &str) -> Program {
    Program {
        source: source.into(),
        language: Language {
            source_file: format!("{}.sh", name),
            compile_command: Some(format!("sh -n {0}.sh && cp {0}.sh {0}", name)),
            compiled_file: Some(name.into()),
            execute_command: format!("sh {}", name),
        },
    }
}

/// Interactor that sends the test input and expects it doubled back
pub fn doubling_interactor() -> Program {
    shell_program(
        "interactor",
        "n=$(cat \"$1\")\n\
         echo \"$n\"\n\
         read reply\n\
         echo \"$reply\" > \"$2\"\n\
         [ \"$reply\" = $((n * 2)) ] || exit 1\n",
    )
}

/// testlib-style checker: exit 0 when output equals the answer byte for byte
pub fn identity_checker() -> Program {
    shell_program("checker", "cmp -s \"$2\" \"$3\" || exit 1\n")
}

pub fn test_case(id: i64, input: &str, answer: &str) -> TestCase {
    TestCase {
        id,
        input: ContentRef::inline(input),
        answer: ContentRef::inline(answer),
        group: None,
        points: 1,
    }
}

pub fn request(source: &str, tests: Vec<TestCase>) -> EvaluationRequest {
    EvaluationRequest {
        id: "sub-1".into(),
        source: source.into(),
        language: shell(),
        tests,
        checker: None,
        interactor: None,
        cpu_time_ms: 1000,
        memory_kb: 262_144,
        stop_on_failure: false,
    }
}

pub fn reached_ids(events: &[Event]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ReachTest { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

pub fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
