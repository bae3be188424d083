use std::collections::BTreeSet;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::failure::TestOutcome;
use crate::runner::TestContext;

pub const PATH_SEPARATOR: &str = " > ";

pub(crate) type HookFn = Rc<dyn Fn() -> TestOutcome>;
pub(crate) type PartFn = Rc<dyn Fn(&mut TestContext) -> TestOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Block(BlockId),
    Test(TestId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Source {
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: Some(location.file().to_string()),
            line: Some(location.line()),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}", self.line.unwrap_or(1)),
            None => f.write_str("<unknown source>"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    #[default]
    Normal,
    Skip,
    Only,
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeAll => "beforeAll",
            Self::AfterAll => "afterAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
        })
    }
}

#[derive(Clone)]
pub struct Hook {
    pub hook_type: HookType,
    pub(crate) func: HookFn,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("hook_type", &self.hook_type)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TestPart {
    pub source: Source,
    pub(crate) func: PartFn,
}

impl fmt::Debug for TestPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestPart")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Ticks at which a test started and left, on the host clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickProfile {
    pub started_tick: Option<u64>,
    pub finished_tick: Option<u64>,
}

impl TickProfile {
    pub fn duration_ticks(&self) -> Option<u64> {
        match (self.started_tick, self.finished_tick) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DescribeBlock {
    pub name: String,
    pub path: String,
    pub tags: BTreeSet<String>,
    pub source: Source,
    pub mode: TestMode,
    pub ticks_between_tests: u32,
    pub hooks: Vec<Hook>,
    pub children: Vec<NodeRef>,
    pub errors: Vec<String>,
    pub parent: Option<BlockId>,
    pub index_in_parent: usize,
}

impl DescribeBlock {
    pub(crate) fn hooks_of(&self, hook_type: HookType) -> impl Iterator<Item = &Hook> + '_ {
        self.hooks
            .iter()
            .filter(move |hook| hook.hook_type == hook_type)
    }
}

#[derive(Debug, Clone)]
pub struct Test {
    pub name: String,
    pub path: String,
    pub tags: BTreeSet<String>,
    pub source: Source,
    pub mode: TestMode,
    pub ticks_before: u32,
    pub parts: Vec<TestPart>,
    pub errors: Vec<String>,
    pub parent: BlockId,
    pub index_in_parent: usize,
    pub profile: TickProfile,
}

/// Arena holding the describe/test hierarchy. Index 0 of the block arena is
/// the unnamed root.
#[derive(Debug, Clone)]
pub struct TestTree {
    blocks: Vec<DescribeBlock>,
    tests: Vec<Test>,
}

impl TestTree {
    pub fn new(root_ticks_between_tests: u32) -> Self {
        let root = DescribeBlock {
            name: String::new(),
            path: String::new(),
            tags: BTreeSet::new(),
            source: Source::unknown(),
            mode: TestMode::Normal,
            ticks_between_tests: root_ticks_between_tests,
            hooks: Vec::new(),
            children: Vec::new(),
            errors: Vec::new(),
            parent: None,
            index_in_parent: 0,
        };
        Self {
            blocks: vec![root],
            tests: Vec::new(),
        }
    }

    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &DescribeBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut DescribeBlock {
        &mut self.blocks[id.0]
    }

    pub fn test(&self, id: TestId) -> &Test {
        &self.tests[id.0]
    }

    pub fn test_mut(&mut self, id: TestId) -> &mut Test {
        &mut self.tests[id.0]
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn tests(&self) -> impl Iterator<Item = (TestId, &Test)> + '_ {
        self.tests
            .iter()
            .enumerate()
            .map(|(index, test)| (TestId(index), test))
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &DescribeBlock)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (BlockId(index), block))
    }

    pub fn find_test(&self, path: &str) -> Option<TestId> {
        self.tests().find(|(_, test)| test.path == path).map(|(id, _)| id)
    }

    pub fn find_block(&self, path: &str) -> Option<BlockId> {
        self.blocks()
            .find(|(_, block)| block.path == path)
            .map(|(id, _)| id)
    }

    pub fn child(&self, block: BlockId, index: usize) -> Option<NodeRef> {
        self.block(block).children.get(index).copied()
    }

    pub fn mode_of(&self, node: NodeRef) -> TestMode {
        match node {
            NodeRef::Block(id) => self.block(id).mode,
            NodeRef::Test(id) => self.test(id).mode,
        }
    }

    /// Blocks from the root down to `block`, inclusive.
    pub fn ancestry(&self, block: BlockId) -> Vec<BlockId> {
        let mut chain = vec![block];
        let mut current = self.block(block).parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.block(parent).parent;
        }
        chain.reverse();
        chain
    }

    /// Child indices leading from the root to `test`.
    pub fn position_of(&self, test: TestId) -> Vec<usize> {
        let test = self.test(test);
        let mut position = vec![test.index_in_parent];
        let mut current = Some(test.parent);
        while let Some(block) = current {
            let block = self.block(block);
            if block.parent.is_some() {
                position.push(block.index_in_parent);
            }
            current = block.parent;
        }
        position.reverse();
        position
    }

    pub fn resolve_position(&self, position: &[usize]) -> Option<NodeRef> {
        let mut current = NodeRef::Block(self.root());
        for &index in position {
            let NodeRef::Block(block) = current else {
                return None;
            };
            current = self.child(block, index)?;
        }
        Some(current)
    }

    pub(crate) fn add_block(
        &mut self,
        parent: BlockId,
        name: String,
        source: Source,
        mode: TestMode,
        tags: BTreeSet<String>,
    ) -> BlockId {
        let id = BlockId(self.blocks.len());
        let parent_block = self.block(parent);
        let block = DescribeBlock {
            path: join_path(&parent_block.path, &name),
            name,
            tags,
            source,
            mode,
            ticks_between_tests: parent_block.ticks_between_tests,
            hooks: Vec::new(),
            children: Vec::new(),
            errors: Vec::new(),
            parent: Some(parent),
            index_in_parent: parent_block.children.len(),
        };
        self.blocks.push(block);
        self.block_mut(parent).children.push(NodeRef::Block(id));
        id
    }

    pub(crate) fn add_test(
        &mut self,
        parent: BlockId,
        name: String,
        source: Source,
        func: PartFn,
        mode: TestMode,
        tags: BTreeSet<String>,
    ) -> TestId {
        let id = TestId(self.tests.len());
        let parent_block = self.block(parent);
        let test = Test {
            path: join_path(&parent_block.path, &name),
            name,
            tags,
            parts: vec![TestPart {
                source: source.clone(),
                func,
            }],
            source,
            mode,
            ticks_before: parent_block.ticks_between_tests,
            errors: Vec::new(),
            parent,
            index_in_parent: parent_block.children.len(),
            profile: TickProfile::default(),
        };
        self.tests.push(test);
        self.block_mut(parent).children.push(NodeRef::Test(id));
        id
    }

    /// A focused block whose children carry no focus of their own hands focus
    /// down to its unmarked children.
    pub(crate) fn propagate_focus(&mut self, block: BlockId) {
        if self.block(block).mode != TestMode::Only {
            return;
        }
        let children = self.block(block).children.clone();
        if children
            .iter()
            .any(|child| self.mode_of(*child) == TestMode::Only)
        {
            return;
        }
        for child in children {
            match child {
                NodeRef::Test(id) if self.test(id).mode == TestMode::Normal => {
                    self.test_mut(id).mode = TestMode::Only;
                }
                NodeRef::Block(id) if self.block(id).mode == TestMode::Normal => {
                    self.block_mut(id).mode = TestMode::Only;
                    self.propagate_focus(id);
                }
                _ => {}
            }
        }
    }
}

fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path.is_empty() {
        name.to_string()
    } else {
        format!("{parent_path}{PATH_SEPARATOR}{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_part() -> PartFn {
        Rc::new(|_: &mut TestContext| Ok(()))
    }

    #[test]
    fn paths_join_names_and_exclude_root() {
        let mut tree = TestTree::new(1);
        let outer = tree.add_block(
            tree.root(),
            "outer".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        let inner = tree.add_block(
            outer,
            "inner".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        let test = tree.add_test(
            inner,
            "leaf".to_string(),
            Source::unknown(),
            noop_part(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        let top = tree.add_test(
            tree.root(),
            "top".to_string(),
            Source::unknown(),
            noop_part(),
            TestMode::Normal,
            BTreeSet::new(),
        );

        assert_eq!(tree.block(inner).path, "outer > inner");
        assert_eq!(tree.test(test).path, "outer > inner > leaf");
        assert_eq!(tree.test(top).path, "top");
        assert_eq!(tree.position_of(test), vec![0, 0, 0]);
        assert_eq!(tree.resolve_position(&[0, 0, 0]), Some(NodeRef::Test(test)));
        assert_eq!(tree.ancestry(inner), vec![tree.root(), outer, inner]);
    }

    #[test]
    fn children_inherit_tick_delay_at_creation() {
        let mut tree = TestTree::new(3);
        let block = tree.add_block(
            tree.root(),
            "b".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        let early = tree.add_test(
            block,
            "early".to_string(),
            Source::unknown(),
            noop_part(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        tree.block_mut(block).ticks_between_tests = 7;
        let late = tree.add_test(
            block,
            "late".to_string(),
            Source::unknown(),
            noop_part(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        let nested = tree.add_block(
            block,
            "nested".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );

        assert_eq!(tree.block(tree.root()).ticks_between_tests, 3);
        assert_eq!(tree.test(early).ticks_before, 3);
        assert_eq!(tree.test(late).ticks_before, 7);
        assert_eq!(tree.block(nested).ticks_between_tests, 7);
    }

    #[test]
    fn source_display_falls_back_to_unknown() {
        assert_eq!(Source::unknown().to_string(), "<unknown source>");
        let source = Source {
            file: Some("suite.rs".to_string()),
            line: None,
        };
        assert_eq!(source.to_string(), "suite.rs:1");
    }
}
