//! Pipeline personas and the context handed to each of them.

use serde::{Deserialize, Serialize};

use crate::findings::ReviewOutcome;
use crate::model::{Agent, Issue};
use crate::prompt::{push_issue, REVIEW_CONTRACT, VERIFICATION_CONTRACT};

/// Longest prior-persona output carried into the next context, in characters.
const MAX_PRIOR_OUTPUT_CHARS: usize = 8_000;

/// Longest diff shown to a reviewer, in characters.
const MAX_DIFF_CHARS: usize = 20_000;

/// What a persona does in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Design,
    Implement,
    Review,
    Verify,
    Custom,
}

impl AgentKind {
    /// Classifies a persona by its name.
    pub fn of(agent: &Agent) -> Self {
        match agent.name.as_str() {
            "architect" => AgentKind::Design,
            "developer" => AgentKind::Implement,
            "reviewer" => AgentKind::Review,
            "tester" => AgentKind::Verify,
            _ => AgentKind::Custom,
        }
    }
}

fn builtin(name: &str, display_name: &str, role: &str, instructions: &str, position: u32) -> Agent {
    Agent {
        id: String::new(),
        name: name.to_string(),
        display_name: display_name.to_string(),
        role: role.to_string(),
        instructions: instructions.to_string(),
        position,
        enabled: true,
        builtin: true,
    }
}

/// The personas every store is seeded with.
pub fn builtin_agents() -> Vec<Agent> {
    vec![
        builtin(
            "architect",
            "Architect",
            "Designs the approach before any code is written",
            "You are a software architect. Study the relevant code and write a short, concrete \
             implementation plan: which files change, which functions are added or modified, and \
             which edge cases matter. Do not modify any files.",
            0,
        ),
        builtin(
            "developer",
            "Developer",
            "Implements the change",
            "You are a senior developer. Implement the change described below, following the plan \
             from earlier personas when one is given. Keep the change focused and consistent with \
             the existing code style.",
            1,
        ),
        builtin(
            "reviewer",
            "Reviewer",
            "Reviews the change for correctness and quality",
            "You are a meticulous code reviewer. Review the changes below for bugs, missing edge \
             cases, and deviations from the task. Do not modify any files.",
            2,
        ),
        builtin(
            "tester",
            "Tester",
            "Runs the test suite and reports results",
            "You are a test engineer. Run the project's test suite and report the results. Do not \
             modify any files.",
            3,
        ),
    ]
}

/// Builder for one persona's instruction string.
pub struct AgentContextBuilder<'a> {
    agent: &'a Agent,
    goal: Option<&'a str>,
    session_summary: Option<String>,
    prior_outputs: Vec<(&'a str, &'a str)>,
    issue: Option<&'a Issue>,
    diff: Option<&'a str>,
    feedback: Option<&'a ReviewOutcome>,
    test_command: Option<&'a str>,
}

impl<'a> AgentContextBuilder<'a> {
    pub fn new(agent: &'a Agent) -> Self {
        Self {
            agent,
            goal: None,
            session_summary: None,
            prior_outputs: Vec::new(),
            issue: None,
            diff: None,
            feedback: None,
            test_command: None,
        }
    }

    pub fn with_goal(mut self, goal: Option<&'a str>) -> Self {
        self.goal = goal.filter(|g| !g.trim().is_empty());
        self
    }

    pub fn with_session_summary(mut self, summary: impl Into<String>) -> Self {
        self.session_summary = Some(summary.into());
        self
    }

    /// Adds an earlier persona's output, labelled with its display name.
    pub fn with_prior_output(mut self, display_name: &'a str, output: &'a str) -> Self {
        self.prior_outputs.push((display_name, output));
        self
    }

    pub fn with_issue(mut self, issue: Option<&'a Issue>) -> Self {
        self.issue = issue;
        self
    }

    /// Sets the diff under review. Ignored for non-review personas.
    pub fn with_diff(mut self, diff: Option<&'a str>) -> Self {
        self.diff = diff.filter(|d| !d.trim().is_empty());
        self
    }

    /// Sets reviewer feedback for a developer re-invocation.
    pub fn with_review_feedback(mut self, feedback: Option<&'a ReviewOutcome>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_test_command(mut self, command: Option<&'a str>) -> Self {
        self.test_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    /// Builds the context.
    pub fn build(&self) -> String {
        let kind = AgentKind::of(self.agent);
        let mut prompt = String::new();

        prompt.push_str(&format!("## {}\n\n", self.agent.display_name));
        prompt.push_str(&self.agent.instructions);
        prompt.push_str("\n\n");

        if let Some(goal) = self.goal {
            prompt.push_str("### Goal\n\n");
            prompt.push_str(goal);
            prompt.push_str("\n\n");
        }

        if let Some(summary) = &self.session_summary {
            prompt.push_str("### Session State\n\n");
            prompt.push_str(summary);
            prompt.push_str("\n\n");
        }

        if let Some(issue) = self.issue {
            prompt.push_str("### Issue\n\n");
            push_issue(&mut prompt, issue);
        }

        for (name, output) in &self.prior_outputs {
            prompt.push_str(&format!("### Output from {}\n\n", name));
            prompt.push_str(&tail_chars(output, MAX_PRIOR_OUTPUT_CHARS));
            prompt.push_str("\n\n");
        }

        if let Some(feedback) = self.feedback {
            prompt.push_str("### Review Feedback\n\n");
            prompt.push_str("The reviewer did not approve the change. Address every point:\n\n");
            if !feedback.summary.is_empty() {
                prompt.push_str(&feedback.summary);
                prompt.push_str("\n\n");
            }
            for (i, issue) in feedback.issues.iter().enumerate() {
                prompt.push_str(&format!("{}. **{}**", i + 1, issue.title));
                if let Some(file) = &issue.file_path {
                    prompt.push_str(&format!(" (`{}`)", file));
                }
                prompt.push('\n');
                if !issue.description.is_empty() {
                    prompt.push_str(&format!("   {}\n", issue.description));
                }
            }
            prompt.push('\n');
        }

        match kind {
            AgentKind::Review => {
                if let Some(diff) = self.diff {
                    prompt.push_str("### Changes Made\n\n");
                    prompt.push_str("```diff\n");
                    prompt.push_str(&head_chars(diff, MAX_DIFF_CHARS));
                    prompt.push_str("\n```\n\n");
                }
                prompt.push_str("### Response Format\n\n");
                prompt.push_str("End your reply with a JSON object:\n");
                prompt.push_str(REVIEW_CONTRACT);
                prompt.push('\n');
            }
            AgentKind::Verify => {
                if let Some(command) = self.test_command {
                    prompt.push_str(&format!("Run the tests with `{}`.\n\n", command));
                }
                prompt.push_str("### Response Format\n\n");
                prompt.push_str("End your reply with a JSON object:\n");
                prompt.push_str(VERIFICATION_CONTRACT);
                prompt.push('\n');
            }
            AgentKind::Design | AgentKind::Implement | AgentKind::Custom => {}
        }

        prompt
    }
}

fn head_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n... (truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

/// The last `max` characters; the end of an assistant reply holds its conclusion.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => format!("(truncated) ...\n{}", &text[idx..]),
        None => text.to_string(),
    }
}
