//! Analysis report types.

use serde::{Deserialize, Serialize};

/// A code location implementing part of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationLocation {
    /// File path relative to the project root.
    #[serde(default)]
    pub file: String,
    /// Function or method name.
    #[serde(default)]
    pub function: String,
    /// Line range, e.g. `13-16`.
    #[serde(default)]
    pub lines: String,
}

/// One feature and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAnalysis {
    #[serde(default)]
    pub feature_description: String,
    #[serde(default)]
    pub implementation_location: Vec<ImplementationLocation>,
}

/// Outcome of running the generated tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tests_passed: bool,
    /// Captured output, bounded in size.
    pub log: String,
}

/// Generated tests and their outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub generated_test_code: String,
    pub execution_result: ExecutionResult,
}

impl VerificationResult {
    pub fn new(test_code: impl Into<String>, tests_passed: bool, log: impl Into<String>) -> Self {
        Self {
            generated_test_code: test_code.into(),
            execution_result: ExecutionResult {
                tests_passed,
                log: log.into(),
            },
        }
    }

    /// Builds the result recorded when verification aborted before a verdict.
    pub fn aborted(test_code: impl Into<String>, log: impl Into<String>) -> Self {
        Self::new(test_code, false, log)
    }

    pub fn tests_passed(&self) -> bool {
        self.execution_result.tests_passed
    }

    pub fn log(&self) -> &str {
        &self.execution_result.log
    }
}

/// Terminal artifact of one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub feature_analysis: Vec<FeatureAnalysis>,
    #[serde(default)]
    pub execution_plan_suggestion: String,
    #[serde(default)]
    pub functional_verification: Option<VerificationResult>,
}

impl AnalysisReport {
    /// Serializes the report for an event payload.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Cuts `log` down to at most `max_bytes` bytes (on a char boundary) and
/// appends a truncation marker when anything was dropped.
pub fn truncate_log(mut log: String, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log;
    }
    let mut cut = max_bytes;
    while cut > 0 && !log.is_char_boundary(cut) {
        cut -= 1;
    }
    log.truncate(cut);
    log.push_str("\n... [output truncated]");
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_in_wire_shape() {
        let report = AnalysisReport {
            feature_analysis: vec![FeatureAnalysis {
                feature_description: "Create a channel".into(),
                implementation_location: vec![ImplementationLocation {
                    file: "src/modules/channel/channel.resolver.ts".into(),
                    function: "createChannel".into(),
                    lines: "13-16".into(),
                }],
            }],
            execution_plan_suggestion: "npm install && npm run start:dev".into(),
            functional_verification: Some(VerificationResult::new("test()", true, "1 passing")),
        };

        let value = report.to_value();
        assert_eq!(
            value["feature_analysis"][0]["implementation_location"][0]["function"],
            "createChannel"
        );
        assert_eq!(
            value["functional_verification"]["execution_result"]["tests_passed"],
            true
        );
        assert_eq!(
            value["functional_verification"]["generated_test_code"],
            "test()"
        );
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let feature: FeatureAnalysis =
            serde_json::from_str(r#"{"feature_description": "Post a message"}"#).unwrap();
        assert!(feature.implementation_location.is_empty());

        let report: AnalysisReport = serde_json::from_str("{}").unwrap();
        assert!(report.functional_verification.is_none());
    }

    #[test]
    fn aborted_verification_fails() {
        let result = VerificationResult::aborted("", "Error: health check timed out");
        assert!(!result.tests_passed());
        assert_eq!(result.log(), "Error: health check timed out");
    }

    #[test]
    fn truncate_log_keeps_short_output() {
        assert_eq!(truncate_log("ok".into(), 10), "ok");
    }

    #[test]
    fn truncate_log_marks_cut_output() {
        let out = truncate_log("a".repeat(100), 10);
        assert!(out.starts_with("aaaaaaaaaa\n"));
        assert!(out.ends_with("[output truncated]"));
    }

    #[test]
    fn truncate_log_respects_char_boundaries() {
        // Each check mark is three bytes.
        let out = truncate_log("✓✓✓✓".into(), 4);
        assert!(out.starts_with("✓\n"));
    }
}
