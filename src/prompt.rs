//! Instruction builders for single-phase cycles.

use std::path::{Path, PathBuf};

use crate::model::{Cycle, Issue, Phase};

/// Most open issues listed in a prompt.
const MAX_LISTED_ISSUES: usize = 20;

/// Most recent cycles summarised in a prompt.
const MAX_RECENT_CYCLES: usize = 5;

/// Output contract for discovery and review cycles.
pub const FINDINGS_CONTRACT: &str = r#"```json
{
  "findings": [
    {
      "category": "bug" | "improvement" | "idea" | "test_failure" | "performance" | "accessibility" | "security",
      "priority": "P0" | "P1" | "P2" | "P3",
      "title": "short title",
      "description": "what is wrong and how to address it",
      "file_path": "path/to/file (optional)"
    }
  ]
}
```"#;

/// Output contract for test cycles and verification personas.
pub const VERIFICATION_CONTRACT: &str = r#"```json
{
  "summary": { "total": 0, "passed": 0, "failed": 0, "skipped": 0 },
  "failures": [
    { "name": "test name", "message": "failure output", "file_path": "path/to/test (optional)" }
  ]
}
```"#;

/// Output contract for reviewer personas.
pub const REVIEW_CONTRACT: &str = r#"```json
{
  "approved": true | false,
  "issues": [
    { "category": "bug", "priority": "P1", "title": "short title", "description": "what to change", "file_path": "path/to/file" }
  ],
  "summary": "one paragraph"
}
```"#;

/// Builder for the instruction sent to a single-phase cycle.
pub struct PhasePromptBuilder<'a> {
    phase: Phase,
    project_path: PathBuf,
    goal: Option<&'a str>,
    issue: Option<&'a Issue>,
    open_issues: &'a [Issue],
    test_command: Option<&'a str>,
    recent_cycles: &'a [Cycle],
}

impl<'a> PhasePromptBuilder<'a> {
    /// Creates a new prompt builder for `phase` against `project_path`.
    pub fn new(phase: Phase, project_path: &Path) -> Self {
        Self {
            phase,
            project_path: project_path.to_path_buf(),
            goal: None,
            issue: None,
            open_issues: &[],
            test_command: None,
            recent_cycles: &[],
        }
    }

    /// Sets the user's goal for the session.
    pub fn with_goal(mut self, goal: Option<&'a str>) -> Self {
        self.goal = goal.filter(|g| !g.trim().is_empty());
        self
    }

    /// Sets the issue this cycle addresses.
    pub fn with_issue(mut self, issue: Option<&'a Issue>) -> Self {
        self.issue = issue;
        self
    }

    /// Sets the known open issues, used to avoid re-reporting them.
    pub fn with_open_issues(mut self, issues: &'a [Issue]) -> Self {
        self.open_issues = issues;
        self
    }

    pub fn with_test_command(mut self, command: Option<&'a str>) -> Self {
        self.test_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    /// Sets recent cycles, oldest first.
    pub fn with_recent_cycles(mut self, cycles: &'a [Cycle]) -> Self {
        self.recent_cycles = cycles;
        self
    }

    /// Builds the prompt.
    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!("## {} Cycle\n\n", title_case(self.phase.as_str())));
        prompt.push_str(&format!(
            "You are working autonomously in the project at `{}`.\n\n",
            self.project_path.display()
        ));

        if let Some(goal) = self.goal {
            prompt.push_str("### Goal\n\n");
            prompt.push_str(goal);
            prompt.push_str("\n\n");
        }

        self.push_recent_cycles(&mut prompt);

        match self.phase {
            Phase::Discovery | Phase::Review => self.push_analysis(&mut prompt),
            Phase::Fix | Phase::Improve | Phase::Pipeline => self.push_change(&mut prompt),
            Phase::Test => self.push_test(&mut prompt),
        }

        prompt
    }

    fn push_analysis(&self, prompt: &mut String) {
        prompt.push_str("### Task\n\n");
        if self.phase == Phase::Review {
            prompt.push_str(
                "Review the current state of the code base, paying particular attention to \
                 recent changes. Look for regressions, code quality problems and missing tests.\n\n",
            );
        } else {
            prompt.push_str(
                "Analyse the project and identify bugs, improvements, performance, security \
                 and accessibility problems worth addressing. Do not modify any files.\n\n",
            );
        }

        if !self.open_issues.is_empty() {
            prompt.push_str("### Already Known\n\n");
            prompt.push_str("Do not report these again:\n\n");
            for issue in self.open_issues.iter().take(MAX_LISTED_ISSUES) {
                prompt.push_str(&format!("- [{}] {}\n", issue.priority, issue.title));
            }
            prompt.push('\n');
        }

        prompt.push_str("### Response Format\n\n");
        prompt.push_str("End your reply with a JSON object:\n");
        prompt.push_str(FINDINGS_CONTRACT);
        prompt.push('\n');
    }

    fn push_change(&self, prompt: &mut String) {
        prompt.push_str("### Task\n\n");
        match self.issue {
            Some(issue) => {
                let verb = if self.phase == Phase::Fix { "Fix" } else { "Implement" };
                prompt.push_str(&format!("{} the following issue:\n\n", verb));
                push_issue(prompt, issue);
            }
            None => prompt.push_str("Make progress towards the goal above.\n\n"),
        }

        prompt.push_str("Keep the change focused. ");
        if let Some(command) = self.test_command {
            prompt.push_str(&format!("Make sure `{}` passes before finishing.", command));
        }
        prompt.push_str("\n\n");
    }

    fn push_test(&self, prompt: &mut String) {
        prompt.push_str("### Task\n\n");
        match self.test_command {
            Some(command) => prompt.push_str(&format!("Run the test suite with `{}`.", command)),
            None => prompt.push_str("Find and run the project's test suite."),
        }
        prompt.push_str(" Do not modify any files.\n\n");

        if let Some(issue) = self.issue {
            prompt.push_str("The last change addressed:\n\n");
            push_issue(prompt, issue);
        }

        prompt.push_str("### Response Format\n\n");
        prompt.push_str("End your reply with a JSON object:\n");
        prompt.push_str(VERIFICATION_CONTRACT);
        prompt.push('\n');
    }

    fn push_recent_cycles(&self, prompt: &mut String) {
        if self.recent_cycles.is_empty() {
            return;
        }
        prompt.push_str("### Recent Cycles\n\n");
        let skip = self.recent_cycles.len().saturating_sub(MAX_RECENT_CYCLES);
        for cycle in &self.recent_cycles[skip..] {
            prompt.push_str(&format!(
                "- #{} {}: {:?}",
                cycle.cycle_number, cycle.phase, cycle.status
            ));
            if let Some(error) = &cycle.error {
                prompt.push_str(&format!(" ({})", error));
            }
            prompt.push('\n');
        }
        prompt.push('\n');
    }
}

/// Appends an issue description block.
pub(crate) fn push_issue(prompt: &mut String, issue: &Issue) {
    prompt.push_str(&format!("**[{}] {}**\n", issue.priority, issue.title));
    if let Some(file) = &issue.file_path {
        prompt.push_str(&format!("File: `{}`\n", file));
    }
    if !issue.description.is_empty() {
        prompt.push_str(&issue.description);
        prompt.push('\n');
    }
    prompt.push('\n');
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
