//! Critic gate: independent review of completion claims.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::prompt::PromptEngine;
use crate::core::response::strip_think;
use crate::driver::{Driver, DriverRequest};
use crate::io::config::Voting;

pub const APPROVED: &str = "APPROVED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    /// Rejection feedback from every dissenting voter.
    pub feedback: String,
}

pub struct Critic {
    voters: Vec<Arc<dyn Driver>>,
    voting: Voting,
    prompts: Arc<PromptEngine>,
}

/// First non-empty line reads `APPROVED` (case-insensitive, trailing period allowed).
pub fn is_approval(reply: &str) -> bool {
    strip_think(reply)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| {
            line.trim_end_matches('.')
                .trim_matches('*')
                .eq_ignore_ascii_case(APPROVED)
        })
}

/// Aggregate approvals under the voting rule.
pub fn tally(voting: Voting, approvals: usize, voters: usize) -> bool {
    if voters == 0 {
        return false;
    }
    match voting {
        Voting::All => approvals == voters,
        Voting::Majority => approvals * 2 > voters,
    }
}

impl Critic {
    pub fn new(voters: Vec<Arc<dyn Driver>>, voting: Voting, prompts: Arc<PromptEngine>) -> Self {
        Self {
            voters,
            voting,
            prompts,
        }
    }

    pub fn review(
        &self,
        task_block: &str,
        history: &str,
        last_output: &str,
        workdir: &Path,
    ) -> Result<Verdict> {
        let prompt = self.prompts.render_critic(task_block, history, last_output)?;
        let mut approvals = 0;
        let mut feedback = Vec::new();
        for voter in &self.voters {
            let response = voter.invoke(&DriverRequest::new(prompt.clone(), workdir))?;
            match response.into_result(voter.name()) {
                Ok(response) if is_approval(&response.output) => {
                    info!(critic = %voter.name(), "critic approved");
                    approvals += 1;
                }
                Ok(response) => {
                    info!(critic = %voter.name(), "critic rejected");
                    feedback.push(strip_think(&response.output));
                }
                Err(err) => {
                    warn!(critic = %voter.name(), err = %format!("{err:#}"), "critic failed, counted as rejection");
                    feedback.push(format!("critic {} unavailable: {err:#}", voter.name()));
                }
            }
        }
        let approved = tally(self.voting, approvals, self.voters.len());
        Ok(Verdict {
            approved,
            feedback: if approved {
                String::new()
            } else {
                feedback.join("\n\n")
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedDriver;

    fn critic(replies: &[&[&str]], voting: Voting) -> Critic {
        let voters = replies
            .iter()
            .enumerate()
            .map(|(idx, replies)| {
                Arc::new(ScriptedDriver::new(format!("c{idx}"), replies.iter().copied()))
                    as Arc<dyn Driver>
            })
            .collect();
        Critic::new(voters, voting, Arc::new(PromptEngine::new()))
    }

    #[test]
    fn recognizes_approval_lines() {
        assert!(is_approval("\n  Approved.\n"));
        assert!(is_approval("<think>x</think>APPROVED"));
        assert!(!is_approval("- tests missing\nAPPROVED"));
        assert!(!is_approval(""));
    }

    #[test]
    fn tally_rules() {
        assert!(tally(Voting::All, 2, 2));
        assert!(!tally(Voting::All, 1, 2));
        assert!(tally(Voting::Majority, 2, 3));
        assert!(!tally(Voting::Majority, 1, 2));
        assert!(!tally(Voting::Majority, 0, 0));
    }

    /// Verifies majority voting approves over a single dissent and collects feedback otherwise.
    #[test]
    fn majority_and_all_voting() {
        let majority = critic(
            &[&["APPROVED"], &["- no tests"], &["APPROVED"]],
            Voting::Majority,
        );
        let verdict = majority
            .review("MAIN TASK: x", "--- TASK ---", "ok", Path::new("."))
            .expect("review");
        assert!(verdict.approved);
        assert!(verdict.feedback.is_empty());

        let all = critic(&[&["APPROVED"], &["- no tests"]], Voting::All);
        let verdict = all
            .review("MAIN TASK: x", "--- TASK ---", "ok", Path::new("."))
            .expect("review");
        assert!(!verdict.approved);
        assert_eq!(verdict.feedback, "- no tests");
    }
}
