//! Test fixtures for pipeline definitions.

use runnel_core::model::{JobDefinition, PipelineDefinition, RunsOn, StepDefinition};
use std::collections::HashMap;

/// Label every fixture job runs on.
pub const LABEL: &str = "local";

/// Factory for pipeline definitions.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One job with one step running `command`.
    pub fn single(command: &str) -> PipelineDefinition {
        PipelineDefinition {
            jobs: vec![Self::job("build", &[], vec![Self::step("run", &[command])])],
        }
    }

    /// `build` then `test` and `lint` in parallel, then `deploy` after `test`.
    pub fn diamond(build_command: &str) -> PipelineDefinition {
        PipelineDefinition {
            jobs: vec![
                Self::job("build", &[], vec![Self::step("compile", &[build_command])]),
                Self::job("test", &["build"], vec![Self::step("unit", &["echo testing"])]),
                Self::job("lint", &["build"], vec![Self::step("check", &["echo linting"])]),
                Self::job("deploy", &["test"], vec![Self::step("ship", &["echo shipping"])]),
            ],
        }
    }

    pub fn job(name: &str, depends_on: &[&str], steps: Vec<StepDefinition>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            runs_on: RunsOn {
                label: LABEL.to_string(),
            },
            working_directory: None,
            env: HashMap::new(),
            timeout_secs: 0,
            steps,
        }
    }

    pub fn step(name: &str, commands: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            depends_on: vec![],
            commands: commands.iter().map(|c| c.to_string()).collect(),
            working_directory: None,
            env: HashMap::new(),
            user: None,
        }
    }
}
