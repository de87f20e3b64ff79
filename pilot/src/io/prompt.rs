//! Prompt templates for the conversation with the model.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::placeholders::PRIMARY_PLACEHOLDER;
use crate::core::retry::RETRY_BUDGET;
use crate::io::command::Interpreter;
use crate::io::config::ParseMode;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const SUMMARY_TEMPLATE: &str = include_str!("prompts/summary.md");
const FOLLOWUP_TEMPLATE: &str = include_str!("prompts/followup.md");

/// One executed command as reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub command: String,
    pub output: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// One file write as reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub path: String,
    pub succeeded: bool,
    pub detail: String,
}

/// Everything that happened in one round, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub writes: Vec<WriteSummary>,
    pub commands: Vec<StepSummary>,
    pub check: Option<StepSummary>,
    pub verified: bool,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("summary", SUMMARY_TEMPLATE)
            .expect("summary template should be valid");
        env.add_template("followup", FOLLOWUP_TEMPLATE)
            .expect("followup template should be valid");
        Self { env }
    }

    /// Fixed instruction message that seeds every turn.
    pub fn system_prompt(
        &self,
        mode: ParseMode,
        interpreter: Interpreter,
        workdir: &Path,
    ) -> Result<String> {
        let template = self.env.get_template("system")?;
        let fence = match interpreter {
            Interpreter::Sh => "sh",
            Interpreter::Bash => "bash",
            Interpreter::PowerShell => "powershell",
            Interpreter::Cmd => "cmd",
            Interpreter::Python => "python",
        };
        let rendered = template.render(context! {
            mode => match mode {
                ParseMode::Protocol => "protocol",
                ParseMode::Fenced => "fenced",
            },
            shell => interpreter.name(),
            fence => fence,
            workdir => workdir.display().to_string(),
            placeholder => PRIMARY_PLACEHOLDER,
            retry_budget => RETRY_BUDGET,
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Formatted summary of command, output, check and verdict.
    pub fn execution_summary(&self, summary: &ExecutionSummary) -> Result<String> {
        let template = self.env.get_template("summary")?;
        let rendered = template.render(context! {
            writes => summary.writes,
            commands => summary.commands.iter().map(trimmed_step).collect::<Vec<_>>(),
            check => summary.check.as_ref().map(trimmed_step),
            verified => summary.verified,
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Instruction appended after a round: continue, or correct with
    /// `remaining` attempts left.
    pub fn follow_up(&self, verified: bool, remaining: u32) -> Result<String> {
        let template = self.env.get_template("followup")?;
        let rendered = template.render(context! { verified => verified, remaining => remaining })?;
        Ok(rendered.trim().to_string())
    }
}

fn trimmed_step(step: &StepSummary) -> StepSummary {
    StepSummary {
        command: step.command.trim().to_string(),
        output: step.output.trim_end().to_string(),
        succeeded: step.succeeded,
        error: step.error.clone(),
    }
}

/// First user message of a turn.
pub fn goal_message(goal: &str) -> String {
    format!("User request: {}", goal.trim())
}
