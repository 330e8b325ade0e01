//! Reasoning collaborators backed by a hosted language model.
//!
//! [`AnthropicClient`] implements [`FeatureLocator`], [`StartupPlanner`] and
//! [`TestGenerator`]. Replies are free text; the JSON or code inside them is
//! pulled out of the first fenced block before parsing.

mod client;
pub mod prompts;

use std::path::Path;

use async_trait::async_trait;

pub use client::{AnthropicClient, ANTHROPIC_VERSION};

use crate::code_tree::{startup_files, ProjectListing, DEFAULT_PROMPT_CHARS};
use crate::collaborators::{CodeAnalysis, FeatureLocator, StartupPlan, StartupPlanner, TestGenerator};
use crate::error::{Error, Result};
use crate::report::FeatureAnalysis;

/// Returns the body of the first fenced block tagged with one of `langs`,
/// then of the first untagged-or-any fence, otherwise the trimmed input.
pub fn extract_fenced<'a>(text: &'a str, langs: &[&str]) -> &'a str {
    for lang in langs {
        let opener = format!("```{}", lang);
        let mut search = 0;
        while let Some(rel) = text[search..].find(&opener) {
            let start = search + rel + opener.len();
            // Only accept the tag when it ends at the line break.
            if text[start..].starts_with('\n') || text[start..].starts_with("\r\n") {
                if let Some(end) = text[start..].find("```") {
                    return text[start..start + end].trim();
                }
            }
            search = start;
        }
    }

    if let Some(open) = text.find("```") {
        let after = &text[open + 3..];
        let body_start = after.find('\n').map_or(0, |nl| nl + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    text.trim()
}

#[async_trait]
impl FeatureLocator for AnthropicClient {
    async fn locate(&self, problem_description: &str, code_root: &Path) -> Result<CodeAnalysis> {
        let root = code_root.to_path_buf();
        let listing = tokio::task::spawn_blocking(move || ProjectListing::scan(&root))
            .await
            .map_err(|e| Error::Analysis(format!("source scan failed: {}", e)))??;
        listing.ensure_not_empty()?;

        let user = prompts::feature_locator_user(
            problem_description,
            &listing.to_prompt(DEFAULT_PROMPT_CHARS),
        );
        let reply = self
            .complete(prompts::FEATURE_LOCATOR_SYSTEM, &user)
            .await
            .map_err(as_analysis_error)?;

        let analysis: CodeAnalysis = serde_json::from_str(extract_fenced(&reply, &["json"]))
            .map_err(|e| Error::Analysis(format!("could not parse feature analysis: {}", e)))?;

        tracing::info!(features = analysis.feature_analysis.len(), "located features");
        Ok(analysis)
    }
}

#[async_trait]
impl StartupPlanner for AnthropicClient {
    async fn plan(&self, code_root: &Path) -> Result<StartupPlan> {
        let files = startup_files(code_root);
        if files.is_empty() {
            return Err(Error::Analysis(
                "could not determine how to start the project: no startup files found".to_string(),
            ));
        }

        let user = prompts::startup_planner_user(&files);
        let reply = self
            .complete(prompts::STARTUP_PLANNER_SYSTEM, &user)
            .await
            .map_err(as_analysis_error)?;

        let plan: StartupPlan = serde_json::from_str(extract_fenced(&reply, &["json"]))
            .map_err(|e| Error::Analysis(format!("could not parse startup plan: {}", e)))?;
        let plan = plan.normalized()?;

        tracing::info!(
            start_command = %plan.start_command,
            health_path = %plan.health_path,
            service_port = ?plan.service_port,
            "planned startup"
        );
        Ok(plan)
    }
}

#[async_trait]
impl TestGenerator for AnthropicClient {
    async fn generate(
        &self,
        problem_description: &str,
        features: &[FeatureAnalysis],
        base_url: &str,
    ) -> Result<String> {
        let user = prompts::test_generator_user(problem_description, features, base_url);
        let reply = self
            .complete(prompts::TEST_GENERATOR_SYSTEM, &user)
            .await
            .map_err(|e| Error::TestGeneration(e.to_string()))?;

        let code = extract_fenced(&reply, &["javascript", "js", "mjs"]);
        if code.is_empty() {
            return Err(Error::TestGeneration(
                "reasoning service returned no test code".to_string(),
            ));
        }
        Ok(code.to_string())
    }
}

/// Collaborator failures are server-side, a missing key included.
fn as_analysis_error(e: Error) -> Error {
    match e {
        Error::Analysis(_) => e,
        other => Error::Analysis(other.to_string()),
    }
}
