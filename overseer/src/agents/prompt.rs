//! Prompt rendering for planner, critic and executor.
//!
//! Templates live in `prompts/` and are compiled into the binary.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::response::{COMPLETED_KEYWORD, FAILED_KEYWORD};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const CRITIC_TEMPLATE: &str = include_str!("prompts/critic.md");
const BREAKDOWN_TEMPLATE: &str = include_str!("prompts/breakdown.md");
const REFLECTION_TEMPLATE: &str = include_str!("prompts/reflection.md");
const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

/// Everything the planner sees in one turn.
#[derive(Debug, Clone, Default)]
pub struct PlannerPromptInput<'a> {
    pub persona: &'a str,
    pub memories: &'a str,
    pub standing_fixes: &'a str,
    pub similar_fix: Option<&'a str>,
    pub task_block: &'a str,
    pub mission_context: &'a str,
    pub constraints: &'a [String],
    pub history: &'a str,
    pub last_output: &'a str,
    pub tools: &'a [String],
    pub json_output: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskLine {
    pub title: String,
    pub status: String,
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

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("critic", CRITIC_TEMPLATE)
            .expect("critic template should be valid");
        env.add_template("breakdown", BREAKDOWN_TEMPLATE)
            .expect("breakdown template should be valid");
        env.add_template("reflection", REFLECTION_TEMPLATE)
            .expect("reflection template should be valid");
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        Self { env }
    }

    pub fn render_planner(&self, input: &PlannerPromptInput<'_>) -> Result<String> {
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            persona => non_empty(input.persona),
            memories => non_empty(input.memories),
            standing_fixes => non_empty(input.standing_fixes),
            similar_fix => input.similar_fix.and_then(non_empty),
            task_block => input.task_block.trim(),
            mission_context => input.mission_context.trim(),
            constraints => input.constraints,
            history => input.history.trim(),
            last_output => non_empty(input.last_output).unwrap_or("(none)"),
            tools => input.tools,
            json_output => input.json_output,
            completed_keyword => COMPLETED_KEYWORD,
            failed_keyword => FAILED_KEYWORD,
        })?;
        Ok(rendered)
    }

    pub fn render_critic(&self, task_block: &str, history: &str, last_output: &str) -> Result<String> {
        let template = self.env.get_template("critic")?;
        Ok(template.render(context! {
            task_block => task_block.trim(),
            history => history.trim(),
            last_output => non_empty(last_output).unwrap_or("(none)"),
        })?)
    }

    pub fn render_breakdown(
        &self,
        mission_context: &str,
        task_block: &str,
        constraints: &[String],
    ) -> Result<String> {
        let template = self.env.get_template("breakdown")?;
        Ok(template.render(context! {
            mission_context => mission_context.trim(),
            task_block => task_block.trim(),
            constraints => constraints,
        })?)
    }

    pub fn render_reflection(&self, tasks: &[TaskLine]) -> Result<String> {
        let template = self.env.get_template("reflection")?;
        Ok(template.render(context! { tasks => tasks })?)
    }

    pub fn render_review(&self, task_block: &str, constraints: &[String]) -> Result<String> {
        let template = self.env.get_template("review")?;
        Ok(template.render(context! {
            task_block => task_block.trim(),
            constraints => constraints,
        })?)
    }

    pub fn render_system(
        &self,
        workdir: &str,
        persona: &str,
        tools: &[String],
        task_block: &str,
    ) -> Result<String> {
        let template = self.env.get_template("system")?;
        Ok(template.render(context! {
            workdir => workdir,
            persona => non_empty(persona),
            tools => tools,
            task_block => task_block.trim(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies optional sections only appear when they have content.
    #[test]
    fn planner_prompt_includes_only_present_sections() {
        let engine = PromptEngine::new();
        let constraints = vec!["no new dependencies".to_string()];
        let prompt = engine
            .render_planner(&PlannerPromptInput {
                task_block: "MAIN TASK: add a README",
                mission_context: "Mission: docs",
                constraints: &constraints,
                history: "--- TASK ---\nMAIN TASK: add a README",
                similar_fix: Some("Error: x\nFix: y"),
                json_output: true,
                ..PlannerPromptInput::default()
            })
            .expect("render");
        assert!(prompt.contains("MAIN TASK: add a README"));
        assert!(prompt.contains("- no new dependencies"));
        assert!(prompt.contains("A similar failure was fixed before"));
        assert!(prompt.contains("\"status\": \"completed\""));
        assert!(prompt.contains("(none)"));
        assert!(!prompt.contains("Execution agent persona"));
        assert!(!prompt.contains("Lessons learned"));
        assert!(!prompt.contains(COMPLETED_KEYWORD));
    }

    #[test]
    fn text_mode_mentions_completion_keyword() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_planner(&PlannerPromptInput {
                task_block: "MAIN TASK: x",
                persona: "You are a QA engineer.",
                ..PlannerPromptInput::default()
            })
            .expect("render");
        assert!(prompt.contains(COMPLETED_KEYWORD));
        assert!(prompt.contains("You are a QA engineer."));
    }

    #[test]
    fn reflection_lists_tasks() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_reflection(&[TaskLine {
                title: "Write docs".to_string(),
                status: "done".to_string(),
            }])
            .expect("render");
        assert!(prompt.contains("- [done] Write docs"));
    }
}
