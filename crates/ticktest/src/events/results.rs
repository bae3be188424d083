use serde::{Deserialize, Serialize};

use super::event::TestEvent;
use super::pipeline::{ListenerContext, TestListener};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotCompleted,
    Passed,
    Failed,
    Todo,
}

/// Aggregate tally for one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunResults {
    pub ran: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    pub describe_block_errors: usize,
    pub additional_errors: Vec<String>,
    pub status: RunStatus,
}

impl RunResults {
    pub fn final_status(&self) -> RunStatus {
        if self.failed > 0 || self.describe_block_errors > 0 || !self.additional_errors.is_empty()
        {
            RunStatus::Failed
        } else if self.todo > 0 {
            RunStatus::Todo
        } else {
            RunStatus::Passed
        }
    }

    /// Passed, or passed with todo tests.
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Passed | RunStatus::Todo)
    }
}

/// Tallies results purely from event types.
#[derive(Debug, Default)]
pub struct ResultCollector;

impl TestListener for ResultCollector {
    fn on_event(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>) {
        let results = &mut *cx.results;
        match event {
            TestEvent::TestRunStarted => *results = RunResults::default(),
            TestEvent::TestPassed(_) => {
                results.ran += 1;
                results.passed += 1;
            }
            TestEvent::TestFailed(_) => {
                results.ran += 1;
                results.failed += 1;
            }
            TestEvent::TestSkipped(_) => results.skipped += 1,
            TestEvent::TestTodo(_) => results.todo += 1,
            TestEvent::DescribeBlockFailed(block) => {
                results.describe_block_errors += cx.tree.block(*block).errors.len();
            }
            TestEvent::TestRunFinished => results.status = results.final_status(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_prefers_failure_then_todo() {
        let mut results = RunResults {
            todo: 1,
            ..RunResults::default()
        };
        assert_eq!(results.final_status(), RunStatus::Todo);
        results.describe_block_errors = 1;
        assert_eq!(results.final_status(), RunStatus::Failed);
        assert_eq!(RunResults::default().final_status(), RunStatus::Passed);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::NotCompleted).expect("encode");
        assert_eq!(json, "\"not_completed\"");
    }
}
