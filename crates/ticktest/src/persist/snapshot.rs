use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::RunResults;
use crate::tree::{BlockId, HookType, NodeRef, Source, TestId, TestMode, TestTree};

pub(crate) const RESUME_FORMAT_VERSION: u16 = 1;

/// Comparable copy of a describe block. Functions are not carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub name: String,
    pub path: String,
    pub tags: BTreeSet<String>,
    pub source: Source,
    pub mode: TestMode,
    pub ticks_between_tests: u32,
    pub hooks: Vec<HookType>,
    pub children: Vec<NodeSnapshot>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSnapshot {
    pub name: String,
    pub path: String,
    pub tags: BTreeSet<String>,
    pub source: Source,
    pub mode: TestMode,
    pub ticks_before: u32,
    pub part_sources: Vec<Source>,
    pub errors: Vec<String>,
    pub started_tick: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSnapshot {
    Describe(BlockSnapshot),
    Test(TestSnapshot),
}

impl BlockSnapshot {
    pub fn capture(tree: &TestTree, id: BlockId) -> Self {
        let block = tree.block(id);
        Self {
            name: block.name.clone(),
            path: block.path.clone(),
            tags: block.tags.clone(),
            source: block.source.clone(),
            mode: block.mode,
            ticks_between_tests: block.ticks_between_tests,
            hooks: block.hooks.iter().map(|hook| hook.hook_type).collect(),
            children: block
                .children
                .iter()
                .map(|child| match *child {
                    NodeRef::Block(child) => NodeSnapshot::Describe(Self::capture(tree, child)),
                    NodeRef::Test(child) => NodeSnapshot::Test(TestSnapshot::capture(tree, child)),
                })
                .collect(),
            errors: block.errors.clone(),
        }
    }
}

impl TestSnapshot {
    pub fn capture(tree: &TestTree, id: TestId) -> Self {
        let test = tree.test(id);
        Self {
            name: test.name.clone(),
            path: test.path.clone(),
            tags: test.tags.clone(),
            source: test.source.clone(),
            mode: test.mode,
            ticks_before: test.ticks_before,
            part_sources: test.parts.iter().map(|part| part.source.clone()).collect(),
            errors: test.errors.clone(),
            started_tick: test.profile.started_tick,
        }
    }
}

/// Everything written before a reload and read back exactly once after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub format_version: u16,
    /// SHA-256 over the structural fields of `root`, lowercase hex.
    pub fingerprint: String,
    pub root: BlockSnapshot,
    pub test_path: String,
    pub test_position: Vec<usize>,
    pub part_index: usize,
    pub results: RunResults,
    pub is_rerun: bool,
    pub run_start_tick: Option<u64>,
}

impl ResumeSnapshot {
    pub(crate) fn capture(
        tree: &TestTree,
        test: TestId,
        part_index: usize,
        results: &RunResults,
        is_rerun: bool,
        run_start_tick: Option<u64>,
    ) -> Self {
        let root = BlockSnapshot::capture(tree, tree.root());
        Self {
            format_version: RESUME_FORMAT_VERSION,
            fingerprint: structure_fingerprint(&root),
            root,
            test_path: tree.test(test).path.clone(),
            test_position: tree.position_of(test),
            part_index,
            results: results.clone(),
            is_rerun,
            run_start_tick,
        }
    }
}

/// Hashes every compared field, leaving out the ones copied forward on
/// resume (errors, start ticks).
pub fn structure_fingerprint(root: &BlockSnapshot) -> String {
    let mut hasher = Sha256::new();
    hash_block(&mut hasher, root);
    to_hex_lower(&hasher.finalize())
}

fn hash_block(hasher: &mut Sha256, block: &BlockSnapshot) {
    hash_field(hasher, b"describe");
    hash_common(
        hasher,
        &block.name,
        &block.path,
        &block.tags,
        &block.source,
        block.mode,
    );
    hash_field(hasher, &block.ticks_between_tests.to_le_bytes());
    for hook in &block.hooks {
        hash_field(hasher, hook.to_string().as_bytes());
    }
    hash_field(hasher, &(block.children.len() as u64).to_le_bytes());
    for child in &block.children {
        match child {
            NodeSnapshot::Describe(child) => hash_block(hasher, child),
            NodeSnapshot::Test(child) => {
                hash_field(hasher, b"test");
                hash_common(
                    hasher,
                    &child.name,
                    &child.path,
                    &child.tags,
                    &child.source,
                    child.mode,
                );
                hash_field(hasher, &child.ticks_before.to_le_bytes());
                for source in &child.part_sources {
                    hash_field(hasher, source.to_string().as_bytes());
                }
            }
        }
    }
}

fn hash_common(
    hasher: &mut Sha256,
    name: &str,
    path: &str,
    tags: &BTreeSet<String>,
    source: &Source,
    mode: TestMode,
) {
    hash_field(hasher, name.as_bytes());
    hash_field(hasher, path.as_bytes());
    for tag in tags {
        hash_field(hasher, tag.as_bytes());
    }
    hash_field(hasher, source.to_string().as_bytes());
    hash_field(hasher, format!("{mode:?}").as_bytes());
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update(bytes);
    hasher.update([0u8]);
}

fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::runner::TestContext;

    fn tree_with(names: &[&str]) -> TestTree {
        let mut tree = TestTree::new(1);
        let block = tree.add_block(
            tree.root(),
            "suite".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        for name in names {
            tree.add_test(
                block,
                name.to_string(),
                Source::unknown(),
                Rc::new(|_: &mut TestContext| Ok(())),
                TestMode::Normal,
                BTreeSet::new(),
            );
        }
        tree
    }

    #[test]
    fn fingerprint_ignores_errors_but_not_names() {
        let mut tree = tree_with(&["a", "b"]);
        let before = structure_fingerprint(&BlockSnapshot::capture(&tree, tree.root()));
        let a = tree.find_test("suite > a").expect("a");
        tree.test_mut(a).errors.push("boom".to_string());
        let after_error = structure_fingerprint(&BlockSnapshot::capture(&tree, tree.root()));
        assert_eq!(before, after_error);

        let renamed = tree_with(&["a", "c"]);
        let after_rename = structure_fingerprint(&BlockSnapshot::capture(&renamed, renamed.root()));
        assert_ne!(before, after_rename);
        assert_eq!(before.len(), 64);
    }

    #[test]
    fn snapshot_json_tags_node_kinds() {
        let tree = tree_with(&["a"]);
        let snapshot = BlockSnapshot::capture(&tree, tree.root());
        let json = serde_json::to_value(&snapshot).expect("encode");
        assert_eq!(json["children"][0]["type"], "describe");
        assert_eq!(json["children"][0]["children"][0]["type"], "test");
        let decoded: BlockSnapshot = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, snapshot);
    }
}
