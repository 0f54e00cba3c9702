//! Evaluation request types
//!
//! These mirror the JSON shape accepted from the outside world. Everything is
//! plain data: the judger decides what to do with it.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::utils::content_hash;
use crate::storage::Locator;

/// How to build and run programs written in one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Name of the source file inside the sandbox (e.g. "main.cpp")
    pub source_file: String,
    /// Shell command that compiles `source_file`; absent for interpreted languages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_command: Option<String>,
    /// File produced by the compiler; absent when the source is run directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_file: Option<String>,
    /// Shell command that runs the program
    pub execute_command: String,
}

impl Language {
    /// Name of the file the execute command expects to find in the sandbox
    pub fn artifact_file(&self) -> &str {
        match (&self.compile_command, &self.compiled_file) {
            (Some(_), Some(compiled)) => compiled,
            _ => &self.source_file,
        }
    }
}

/// Reference to a piece of content: by hash, by locator, or inline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    /// Hex-encoded SHA-256 of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Where to fetch the content from (`s3://`, `file://`, `data:` or a storage key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Literal content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
}

impl ContentRef {
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            inline: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn url(url: impl Into<String>, hash: Option<String>) -> Self {
        Self {
            hash,
            url: Some(url.into()),
            inline: None,
        }
    }

    /// Store key and locator for this reference.
    ///
    /// The key is the declared hash when present, otherwise the hash of the
    /// inline content. A bare URL gets a `url-` key, which is not a content
    /// hash and therefore skips the integrity check.
    pub fn resolve(&self) -> Result<(String, Locator)> {
        let (derived_key, locator) = match (&self.inline, &self.url) {
            (Some(content), _) => (
                content_hash(content),
                Locator::Inline(content.clone().into_bytes()),
            ),
            (None, Some(url)) => (
                format!("url-{}", content_hash(url)),
                Locator::Url(url.clone()),
            ),
            (None, None) => anyhow::bail!("Content reference has neither url nor inline content"),
        };

        let key = match &self.hash {
            Some(hash) => hash.to_ascii_lowercase(),
            None => derived_key,
        };

        Ok((key, locator))
    }
}

/// A single test of an evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub input: ContentRef,
    pub answer: ContentRef,
    /// Subtask this test belongs to; grouped tests are scored all-or-nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default = "default_points")]
    pub points: u32,
}

fn default_points() -> u32 {
    1
}

/// Source of a helper program (checker or interactor)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub source: String,
    pub language: Language,
}

/// Everything needed to judge one submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub id: String,
    pub source: String,
    pub language: Language,
    pub tests: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<Program>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactor: Option<Program>,
    /// CPU time limit per test in milliseconds
    pub cpu_time_ms: u64,
    /// Memory limit per test in KiB
    pub memory_kb: u64,
    /// Ignore the remaining tests after the first non-accepted verdict
    #[serde(default)]
    pub stop_on_failure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inline_uses_content_hash() {
        let (key, locator) = ContentRef::inline("1 2\n").resolve().unwrap();
        assert_eq!(key, content_hash("1 2\n"));
        assert_eq!(locator, Locator::Inline(b"1 2\n".to_vec()));
    }

    #[test]
    fn test_resolve_prefers_declared_hash() {
        let hash = "AB".repeat(32);
        let (key, locator) = ContentRef::url("s3://tests/1.in", Some(hash.clone()))
            .resolve()
            .unwrap();
        assert_eq!(key, hash.to_ascii_lowercase());
        assert_eq!(locator, Locator::Url("s3://tests/1.in".into()));
    }

    #[test]
    fn test_resolve_bare_url_is_not_a_content_hash() {
        let (key, _) = ContentRef::url("file:///data/1.in", None).resolve().unwrap();
        assert!(key.starts_with("url-"));
        assert!(!crate::core::utils::is_content_hash(&key));
    }

    #[test]
    fn test_resolve_empty_reference_fails() {
        assert!(ContentRef::default().resolve().is_err());
    }

    #[test]
    fn test_request_json_defaults() {
        let json = r#"{
            "id": "sub-1",
            "source": "print(1)",
            "language": {"source_file": "main.py", "execute_command": "python3 main.py"},
            "tests": [{"id": 1, "input": {"inline": ""}, "answer": {"inline": "1\n"}}],
            "cpu_time_ms": 1000,
            "memory_kb": 262144
        }"#;
        let request: EvaluationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.tests[0].points, 1);
        assert!(request.tests[0].group.is_none());
        assert!(request.checker.is_none());
        assert!(!request.stop_on_failure);
        assert_eq!(request.language.artifact_file(), "main.py");
    }

    #[test]
    fn test_artifact_file_for_compiled_language() {
        let lang = Language {
            source_file: "main.cpp".into(),
            compile_command: Some("g++ -O2 -o main main.cpp".into()),
            compiled_file: Some("main".into()),
            execute_command: "./main".into(),
        };
        assert_eq!(lang.artifact_file(), "main");
    }
}
