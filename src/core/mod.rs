//! Core data model shared by every stage of an evaluation

pub mod outcome;
pub mod request;
pub mod utils;
pub mod verdict;

pub use outcome::{EvaluationOutcome, EvaluationStatus, Score, TestOutcome};
pub use request::{ContentRef, EvaluationRequest, Language, Program, TestCase};
pub use verdict::Verdict;
