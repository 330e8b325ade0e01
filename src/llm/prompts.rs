//! Prompt text for the reasoning collaborators.

use crate::report::FeatureAnalysis;

/// System prompt for locating feature implementations.
pub const FEATURE_LOCATOR_SYSTEM: &str = r#"You are an expert code analyst. Your task is to analyze source code and locate where specific features are implemented.

Given a problem description listing required features and the source files of a project, you must:
1. Identify each feature mentioned in the problem description
2. Find the exact code locations (file, function, line numbers) that implement each feature
3. Suggest how to run the project

Output ONLY valid JSON in this format:
{
  "feature_analysis": [
    {
      "feature_description": "Description of the feature",
      "implementation_location": [
        {"file": "path/to/file.ts", "function": "functionName", "lines": "startLine-endLine"}
      ]
    }
  ],
  "execution_plan_suggestion": "How to run the project (e.g. npm install && npm run start)"
}

Be precise with line numbers and count them from the file content you were given. Include every relevant location when a feature spans several files. Base the execution suggestion on the scripts in package.json, pyproject.toml or similar manifests."#;

/// System prompt for planning how to start a project.
pub const STARTUP_PLANNER_SYSTEM: &str = r#"You are a DevOps expert. Decide how to start this project inside a plain container built from a language base image, with the project mounted as the working directory.

Rules:
1. There is no docker or docker-compose inside the container; use the native toolchain (npm, pip, cargo, go)
2. Put dependency installation in "install_command" and the long-running server in "start_command"
3. The service must listen on all interfaces; the PORT environment variable holds the port it should use
4. Pick a health path that answers once the service is up (often /health, /api/health, or /graphql for GraphQL servers)
5. Read the README for special instructions

Output ONLY valid JSON in this format:
{
  "base_image": "node:20-slim",
  "install_command": "npm install",
  "start_command": "npm run start",
  "health_path": "/graphql",
  "service_port": 3000,
  "env": {"KEY": "VALUE"}
}"#;

/// System prompt for writing verification tests.
pub const TEST_GENERATOR_SYSTEM: &str = r#"You are an expert test engineer. Generate functional tests that verify the features work correctly against a running service.

The tests must:
1. Exercise each feature end-to-end through real HTTP requests
2. Read the service address from process.env.BASE_URL
3. Be a single self-contained ES module runnable with Node.js 20 (use the built-in fetch, no npm packages)
4. Log what is being tested and the responses received
5. Print "VERDICT: PASS" as the last line when every check passed, otherwise print "VERDICT: FAIL" and exit with a non-zero status

For GraphQL APIs send POST requests with a JSON body containing the query. For REST APIs check both status codes and response bodies.

Output ONLY the test code, no explanations."#;

/// User prompt for the feature locator.
pub fn feature_locator_user(problem_description: &str, source_listing: &str) -> String {
    format!(
        "## Problem Description\n{}\n\n## Source Code\n{}\n\nAnalyze the code and provide the feature location report in JSON format.\n",
        problem_description, source_listing
    )
}

/// User prompt for the startup planner.
pub fn startup_planner_user(files: &[(String, String)]) -> String {
    let sections: Vec<String> = files
        .iter()
        .map(|(name, content)| format!("## {}\n```\n{}\n```", name, content))
        .collect();
    format!(
        "Analyze this project and determine how to start it:\n\n{}\n\nOutput the startup configuration as JSON.\n",
        sections.join("\n\n")
    )
}

/// User prompt for the test generator.
pub fn test_generator_user(
    problem_description: &str,
    features: &[FeatureAnalysis],
    base_url: &str,
) -> String {
    let feature_lines: Vec<String> = features
        .iter()
        .map(|feature| {
            let locations: Vec<String> = feature
                .implementation_location
                .iter()
                .map(|loc| format!("{}:{}", loc.file, loc.function))
                .collect();
            format!("- {}: {}", feature.feature_description, locations.join(", "))
        })
        .collect();

    format!(
        "## Problem Description\n{}\n\n## Feature Analysis\n{}\n\n## Service\nBase URL: {}\n\nGenerate functional test code that verifies these features against the running service.\n",
        problem_description,
        feature_lines.join("\n"),
        base_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ImplementationLocation;

    #[test]
    fn test_prompt_lists_locations() {
        let features = vec![FeatureAnalysis {
            feature_description: "Create a channel".into(),
            implementation_location: vec![
                ImplementationLocation {
                    file: "src/channel.resolver.ts".into(),
                    function: "createChannel".into(),
                    lines: "13-16".into(),
                },
                ImplementationLocation {
                    file: "src/channel.service.ts".into(),
                    function: "create".into(),
                    lines: "21-30".into(),
                },
            ],
        }];

        let prompt = test_generator_user("Build a forum", &features, "http://127.0.0.1:20001");

        assert!(prompt.contains(
            "- Create a channel: src/channel.resolver.ts:createChannel, src/channel.service.ts:create"
        ));
        assert!(prompt.contains("Base URL: http://127.0.0.1:20001"));
    }

    #[test]
    fn startup_prompt_fences_each_file() {
        let prompt = startup_planner_user(&[
            ("package.json".into(), "{}".into()),
            ("README.md".into(), "# app".into()),
        ]);
        assert!(prompt.contains("## package.json\n```\n{}\n```"));
        assert!(prompt.contains("## README.md\n```\n# app\n```"));
    }
}
