mod filter;
mod model;

pub use filter::TestFilter;
pub(crate) use model::{HookFn, PartFn};
pub use model::{
    BlockId, DescribeBlock, Hook, HookType, NodeRef, Source, Test, TestId, TestMode, TestPart,
    TestTree, TickProfile, PATH_SEPARATOR,
};
