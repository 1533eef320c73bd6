//! Request and result types exchanged between the API boundary, the broker
//! and the sandbox runner.
//!
//! `ExecutionResult` keeps `runtime` and `memory` as integers in memory but
//! puts them on the wire as `"<n>ms"` and `"<n>mb"` strings, which is the
//! shape existing clients of the service already parse.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;
use crate::languages::LanguageRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Cpp,
    Java,
    Go,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Javascript,
        Language::Cpp,
        Language::Java,
        Language::Go,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(s.to_string()))
    }
}

/// Bounds applied to a request before it may be queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_code_length: usize,
    pub max_stdin_length: usize,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_timeout_ms: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_code_length: 10_000,
            max_stdin_length: 1_000,
            min_timeout_ms: 100,
            max_timeout_ms: 5_000,
            default_timeout_ms: 2_000,
        }
    }
}

/// One program to run. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: Language,
    pub code: String,
    #[serde(default, alias = "input")]
    pub stdin: String,
    #[serde(
        rename = "timeoutMs",
        alias = "timeout",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            stdin: String::new(),
            timeout_ms: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Timeout to apply, falling back to the configured default.
    pub fn effective_timeout_ms(&self, limits: &RequestLimits) -> u64 {
        self.timeout_ms.unwrap_or(limits.default_timeout_ms)
    }

    /// Check every invariant that must hold before the request is queued.
    pub fn validate(
        &self,
        limits: &RequestLimits,
        registry: &LanguageRegistry,
    ) -> Result<(), ValidationError> {
        if registry.get(self.language).is_none() {
            return Err(ValidationError::UnsupportedLanguage(
                self.language.to_string(),
            ));
        }

        let code_len = self.code.chars().count();
        if code_len == 0 {
            return Err(ValidationError::EmptyCode);
        }
        if code_len > limits.max_code_length {
            return Err(ValidationError::CodeTooLong {
                max: limits.max_code_length,
                actual: code_len,
            });
        }

        let stdin_len = self.stdin.chars().count();
        if stdin_len > limits.max_stdin_length {
            return Err(ValidationError::StdinTooLong {
                max: limits.max_stdin_length,
                actual: stdin_len,
            });
        }

        let timeout = self.effective_timeout_ms(limits);
        if timeout < limits.min_timeout_ms || timeout > limits.max_timeout_ms {
            return Err(ValidationError::TimeoutOutOfRange {
                min: limits.min_timeout_ms,
                max: limits.max_timeout_ms,
                actual: timeout,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Timeout,
    Error,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock milliseconds from just before container creation.
    #[serde(serialize_with = "ser_millis", deserialize_with = "de_millis")]
    pub runtime: u64,
    /// Peak resident memory in whole megabytes.
    #[serde(serialize_with = "ser_megabytes", deserialize_with = "de_megabytes")]
    pub memory: u64,
}

impl ExecutionResult {
    pub fn success(stdout: String, stderr: String, runtime: u64, memory: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            stdout,
            stderr,
            runtime,
            memory,
        }
    }

    pub fn timeout(timeout_ms: u64, runtime: u64) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            stdout: String::new(),
            stderr: format!("Execution exceeded timeout of {}ms", timeout_ms),
            runtime,
            memory: 0,
        }
    }

    pub fn error(message: impl Into<String>, runtime: u64) -> Self {
        Self {
            status: ExecutionStatus::Error,
            stdout: String::new(),
            stderr: message.into(),
            runtime,
            memory: 0,
        }
    }
}

fn ser_millis<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}ms", value))
}

fn ser_megabytes<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}mb", value))
}

fn de_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    de_with_suffix(deserializer, "ms")
}

fn de_megabytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    de_with_suffix(deserializer, "mb")
}

fn de_with_suffix<'de, D: Deserializer<'de>>(
    deserializer: D,
    suffix: &'static str,
) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => text
            .trim_end_matches(suffix)
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected '<n>{}', got '{}'", suffix, text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_original_field_names() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "language": "python",
            "code": "print(1)",
            "input": "abc",
            "timeout": 1500
        }))
        .unwrap();

        assert_eq!(request.language, Language::Python);
        assert_eq!(request.stdin, "abc");
        assert_eq!(request.timeout_ms, Some(1500));
    }

    #[test]
    fn test_request_defaults() {
        let request: ExecutionRequest =
            serde_json::from_value(json!({"language": "go", "code": "package main"})).unwrap();
        assert_eq!(request.stdin, "");
        assert_eq!(request.effective_timeout_ms(&RequestLimits::default()), 2000);
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        let parsed = serde_json::from_value::<ExecutionRequest>(json!({
            "language": "cobol",
            "code": "DISPLAY 'HI'"
        }));
        assert!(parsed.is_err());
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(ValidationError::UnsupportedLanguage("cobol".to_string()))
        );
    }

    #[test]
    fn test_validate_bounds() {
        let limits = RequestLimits::default();
        let registry = LanguageRegistry::default();

        let ok = ExecutionRequest::new(Language::Python, "print(1)");
        assert!(ok.validate(&limits, &registry).is_ok());

        let empty = ExecutionRequest::new(Language::Python, "");
        assert_eq!(empty.validate(&limits, &registry), Err(ValidationError::EmptyCode));

        let long = ExecutionRequest::new(Language::Python, "x".repeat(10_001));
        assert!(matches!(
            long.validate(&limits, &registry),
            Err(ValidationError::CodeTooLong { max: 10_000, actual: 10_001 })
        ));

        let big_stdin = ExecutionRequest::new(Language::Python, "x").with_stdin("y".repeat(1_001));
        assert!(matches!(
            big_stdin.validate(&limits, &registry),
            Err(ValidationError::StdinTooLong { .. })
        ));

        for timeout in [99, 5_001] {
            let req = ExecutionRequest::new(Language::Python, "x").with_timeout_ms(timeout);
            assert!(matches!(
                req.validate(&limits, &registry),
                Err(ValidationError::TimeoutOutOfRange { .. })
            ));
        }
        for timeout in [100, 5_000] {
            let req = ExecutionRequest::new(Language::Python, "x").with_timeout_ms(timeout);
            assert!(req.validate(&limits, &registry).is_ok());
        }
    }

    #[test]
    fn test_validate_rejects_language_missing_from_registry() {
        let registry = LanguageRegistry::default().without(Language::Go);
        let req = ExecutionRequest::new(Language::Go, "package main");
        assert_eq!(
            req.validate(&RequestLimits::default(), &registry),
            Err(ValidationError::UnsupportedLanguage("go".to_string()))
        );
    }

    #[test]
    fn test_result_wire_shape() {
        let result = ExecutionResult::timeout(2000, 2003);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "timeout",
                "stdout": "",
                "stderr": "Execution exceeded timeout of 2000ms",
                "runtime": "2003ms",
                "memory": "0mb"
            })
        );

        let back: ExecutionResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);

        let numeric: ExecutionResult = serde_json::from_value(json!({
            "status": "success", "stdout": "hi", "stderr": "", "runtime": 12, "memory": 3
        }))
        .unwrap();
        assert_eq!(numeric.runtime, 12);
        assert_eq!(numeric.memory, 3);
    }
}
