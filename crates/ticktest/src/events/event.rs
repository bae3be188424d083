use serde_json::Value;

use crate::tree::{BlockId, TestId};

/// Lifecycle notifications raised by the runner, in tree-walk order.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    TestRunStarted,
    DescribeBlockEntered(BlockId),
    TestEntered(TestId),
    TestStarted(TestId),
    TestPassed(TestId),
    TestFailed(TestId),
    TestSkipped(TestId),
    TestTodo(TestId),
    DescribeBlockFinished(BlockId),
    DescribeBlockFailed(BlockId),
    TestRunFinished,
    LoadError,
    Custom { name: String, data: Value },
}

impl TestEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestRunStarted => "testRunStarted",
            Self::DescribeBlockEntered(_) => "describeBlockEntered",
            Self::TestEntered(_) => "testEntered",
            Self::TestStarted(_) => "testStarted",
            Self::TestPassed(_) => "testPassed",
            Self::TestFailed(_) => "testFailed",
            Self::TestSkipped(_) => "testSkipped",
            Self::TestTodo(_) => "testTodo",
            Self::DescribeBlockFinished(_) => "describeBlockFinished",
            Self::DescribeBlockFailed(_) => "describeBlockFailed",
            Self::TestRunFinished => "testRunFinished",
            Self::LoadError => "loadError",
            Self::Custom { .. } => "customEvent",
        }
    }
}
