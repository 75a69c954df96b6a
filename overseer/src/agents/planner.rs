//! Planner role: decides the next instruction each turn.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::agents::prompt::{PlannerPromptInput, PromptEngine, TaskLine};
use crate::core::quota::reply_rate_limited;
use crate::core::response::{FAILED_KEYWORD, parse_decision, strip_think};
use crate::core::types::PlannerDecision;
use crate::driver::{Driver, DriverRequest};
use crate::io::config::OutputFormat;

/// Outcome of one planner call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerTurn {
    Decision(PlannerDecision),
    /// The reply carried a rate-limit signature; the text is kept for the scheduler.
    RateLimited(String),
    /// The driver failed after retries.
    Failed(String),
}

pub struct Planner {
    driver: Arc<dyn Driver>,
    output_format: OutputFormat,
    prompts: Arc<PromptEngine>,
}

impl Planner {
    pub fn new(driver: Arc<dyn Driver>, output_format: OutputFormat, prompts: Arc<PromptEngine>) -> Self {
        Self {
            driver,
            output_format,
            prompts,
        }
    }

    pub fn json_output(&self) -> bool {
        self.output_format == OutputFormat::Json
    }

    /// Render the turn prompt.
    pub fn prompt(&self, input: &PlannerPromptInput<'_>) -> Result<String> {
        self.prompts.render_planner(input)
    }

    /// Ask for the next decision with an already rendered prompt.
    #[instrument(skip_all, fields(driver = %self.driver.name()))]
    pub fn decide(&self, prompt: &str, workdir: &Path) -> Result<PlannerTurn> {
        let reply = match self.ask(prompt, workdir)? {
            Ok(reply) => reply,
            Err(turn) => return Ok(turn),
        };
        let decision = parse_decision(&reply);
        debug!(decision = ?decision, "planner decided");
        Ok(PlannerTurn::Decision(decision))
    }

    /// Split a task into sub-tasks. `None` when the planner gives no usable list.
    pub fn breakdown(
        &self,
        mission_context: &str,
        task_block: &str,
        constraints: &[String],
        workdir: &Path,
    ) -> Result<Option<Vec<String>>> {
        let prompt = self
            .prompts
            .render_breakdown(mission_context, task_block, constraints)?;
        let reply = match self.ask(&prompt, workdir)? {
            Ok(reply) => reply,
            Err(turn) => {
                warn!(turn = ?turn, "planner breakdown unavailable");
                return Ok(None);
            }
        };
        Ok(parse_task_list(&reply))
    }

    /// Lessons-learned bullets for long-term memory.
    pub fn reflect(&self, tasks: &[TaskLine], workdir: &Path) -> Result<Option<String>> {
        let prompt = self.prompts.render_reflection(tasks)?;
        match self.ask(&prompt, workdir)? {
            Ok(reply) if !reply.trim().is_empty() && !reply.contains(FAILED_KEYWORD) => {
                Ok(Some(reply.trim().to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Reviewer mode: a review plan for the task, no execution.
    pub fn review(&self, task_block: &str, constraints: &[String], workdir: &Path) -> Result<String> {
        let prompt = self.prompts.render_review(task_block, constraints)?;
        match self.ask(&prompt, workdir)? {
            Ok(reply) => Ok(reply.trim().to_string()),
            Err(PlannerTurn::Failed(message)) => Ok(format!("review unavailable: {message}")),
            Err(_) => Ok("review unavailable: rate limited".to_string()),
        }
    }

    /// Invoke the driver; `Err(turn)` carries a non-decision outcome.
    fn ask(&self, prompt: &str, workdir: &Path) -> Result<std::result::Result<String, PlannerTurn>> {
        info!(prompt_chars = prompt.chars().count(), "planner thinking");
        let response = self.driver.invoke(&DriverRequest::new(prompt, workdir))?;
        let diagnostic = response.diagnostic_text();
        if reply_rate_limited(&diagnostic, response.is_success()) {
            return Ok(Err(PlannerTurn::RateLimited(diagnostic)));
        }
        let response = match response.into_result(self.driver.name()) {
            Ok(response) => response,
            Err(err) => return Ok(Err(PlannerTurn::Failed(format!("{err:#}")))),
        };
        let mut reply = strip_think(&response.output);
        if self.json_output() {
            reply = unwrap_envelope(&reply);
        }
        Ok(Ok(reply))
    }
}

/// CLI JSON envelopes (`{"result": ...}` / `{"response": ...}`) hold the model text.
pub fn unwrap_envelope(text: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        result: Option<String>,
        response: Option<String>,
    }
    match serde_json::from_str::<Envelope>(text.trim()) {
        Ok(Envelope {
            result: Some(inner),
            ..
        })
        | Ok(Envelope {
            response: Some(inner),
            ..
        }) => inner,
        _ => text.to_string(),
    }
}

/// Parse `{"tasks": [...]}` from a reply, tolerating code fences.
pub fn parse_task_list(reply: &str) -> Option<Vec<String>> {
    #[derive(Deserialize)]
    struct TaskList {
        tasks: Vec<String>,
    }
    let trimmed = reply.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return None,
    };
    let list: TaskList = serde_json::from_str(body).ok()?;
    let tasks: Vec<String> = list
        .tasks
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    (!tasks.is_empty()).then_some(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverResponse;
    use crate::test_support::ScriptedDriver;

    fn planner(driver: ScriptedDriver, format: OutputFormat) -> Planner {
        Planner::new(Arc::new(driver), format, Arc::new(PromptEngine::new()))
    }

    #[test]
    fn parses_task_lists() {
        assert_eq!(
            parse_task_list("```json\n{\"tasks\": [\"a\", \" \", \"b\"]}\n```"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(parse_task_list("{\"tasks\": []}"), None);
        assert_eq!(parse_task_list("no json"), None);
    }

    #[test]
    fn unwraps_cli_envelopes() {
        assert_eq!(
            unwrap_envelope("{\"type\":\"result\",\"result\":\"{\\\"status\\\":\\\"completed\\\"}\"}"),
            "{\"status\":\"completed\"}"
        );
        assert_eq!(unwrap_envelope("{\"command\": \"ls\"}"), "{\"command\": \"ls\"}");
    }

    #[test]
    fn decide_parses_reply() {
        let driver = ScriptedDriver::new("brain", ["<think>hmm</think>{\"command\": \"ls src\", \"status\": \"continue\"}"]);
        let turn = planner(driver, OutputFormat::Json)
            .decide("prompt", Path::new("."))
            .expect("decide");
        assert_eq!(
            turn,
            PlannerTurn::Decision(PlannerDecision::Command("ls src".to_string()))
        );
    }

    /// Verifies short rate-limit replies are routed to the scheduler, and failures reported.
    #[test]
    fn decide_reports_rate_limits_and_failures() {
        let driver = ScriptedDriver::from_responses(
            "brain",
            vec![
                DriverResponse::success("You've hit your usage limit. Resets at 9am."),
                DriverResponse {
                    output: String::new(),
                    stderr: "boom".to_string(),
                    exit_code: 1,
                    timed_out: false,
                    attempts: 2,
                },
            ],
        );
        let planner = planner(driver, OutputFormat::Text);
        assert!(matches!(
            planner.decide("p", Path::new(".")).expect("decide"),
            PlannerTurn::RateLimited(_)
        ));
        match planner.decide("p", Path::new(".")).expect("decide") {
            PlannerTurn::Failed(message) => assert!(message.contains("exit 1: boom")),
            other => panic!("unexpected turn {other:?}"),
        }
    }

    #[test]
    fn breakdown_and_reflect() {
        let driver = ScriptedDriver::new(
            "brain",
            ["{\"tasks\": [\"write test\", \"fix bug\"]}", "- keep tests fast"],
        );
        let planner = planner(driver, OutputFormat::Text);
        assert_eq!(
            planner
                .breakdown("Mission: m", "MAIN TASK: fix", &[], Path::new("."))
                .expect("breakdown"),
            Some(vec!["write test".to_string(), "fix bug".to_string()])
        );
        assert_eq!(
            planner.reflect(&[], Path::new(".")).expect("reflect"),
            Some("- keep tests fast".to_string())
        );
    }
}
