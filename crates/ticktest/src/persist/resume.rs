use thiserror::Error;
use tracing::{info, warn};

use super::snapshot::{structure_fingerprint, BlockSnapshot, NodeSnapshot, ResumeSnapshot};
use super::store::{PersistedStage, StoreError};
use crate::state::TestState;
use crate::tree::{BlockId, NodeRef, TestId, TestTree};

/// First structural difference found between the rebuilt tree and the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeMismatch {
    pub path: String,
    pub field: &'static str,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("no resume data was saved before the reload")]
    MissingSnapshot,
    #[error("tests changed during reload: `{}` differs at {}", .0.field, display_path(&.0.path))]
    Mismatch(ResumeMismatch),
    #[error("resume data does not point at a test: {0}")]
    UnknownTest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint {
    pub(crate) test: TestId,
    pub(crate) part_index: usize,
}

/// Saves the whole tree and the position after the current part, then marks
/// the stage `ToReload`.
pub(crate) fn prepare_reload(
    state: &mut TestState,
    test: TestId,
    current_part: usize,
) -> Result<(), StoreError> {
    let snapshot = ResumeSnapshot::capture(
        &state.tree,
        test,
        current_part + 1,
        &state.results,
        state.is_rerun,
        state.run_start_tick,
    );
    info!(
        test = %snapshot.test_path,
        part = snapshot.part_index,
        fingerprint = %snapshot.fingerprint,
        "resume_snapshot_saved"
    );
    state.store_mut().save_resume(&snapshot)?;
    state.set_stage(PersistedStage::ToReload)
}

/// Consumes the saved snapshot and matches it against the freshly registered
/// tree. On success, errors recorded before the reload are copied into the new
/// tree and the resume position is returned.
pub(crate) fn resume_after_reload(state: &mut TestState) -> Result<ResumePoint, ResumeError> {
    let snapshot = state
        .store_mut()
        .take_resume()?
        .ok_or(ResumeError::MissingSnapshot)?;
    state.results = snapshot.results.clone();
    if snapshot.is_rerun {
        state.mark_rerun();
    }
    state.run_start_tick = snapshot.run_start_tick;

    let current = BlockSnapshot::capture(&state.tree, state.tree.root());
    compare_blocks(&current, &snapshot.root).map_err(|mismatch| {
        warn!(path = %mismatch.path, field = mismatch.field, "resume_mismatch");
        ResumeError::Mismatch(mismatch)
    })?;
    if structure_fingerprint(&current) != snapshot.fingerprint {
        warn!(saved = %snapshot.fingerprint, "resume_fingerprint_mismatch");
        return Err(ResumeError::Mismatch(ResumeMismatch {
            path: String::new(),
            field: "fingerprint",
        }));
    }

    let root = state.tree.root();
    copy_forward(&mut state.tree, root, &snapshot.root);

    let test = match state.tree.resolve_position(&snapshot.test_position) {
        Some(NodeRef::Test(test)) if state.tree.test(test).path == snapshot.test_path => test,
        _ => return Err(ResumeError::UnknownTest(snapshot.test_path)),
    };
    info!(test = %snapshot.test_path, part = snapshot.part_index, "resume_matched");
    Ok(ResumePoint {
        test,
        part_index: snapshot.part_index,
    })
}

fn compare_blocks(current: &BlockSnapshot, saved: &BlockSnapshot) -> Result<(), ResumeMismatch> {
    let mismatch = |field| ResumeMismatch {
        path: current.path.clone(),
        field,
    };
    if current.name != saved.name {
        return Err(mismatch("name"));
    }
    if current.path != saved.path {
        return Err(mismatch("path"));
    }
    if current.tags != saved.tags {
        return Err(mismatch("tags"));
    }
    if current.source != saved.source {
        return Err(mismatch("source"));
    }
    if current.mode != saved.mode {
        return Err(mismatch("mode"));
    }
    if current.ticks_between_tests != saved.ticks_between_tests {
        return Err(mismatch("ticks_between_tests"));
    }
    if current.hooks != saved.hooks {
        return Err(mismatch("hooks"));
    }
    if current.children.len() != saved.children.len() {
        return Err(mismatch("children"));
    }
    for (current_child, saved_child) in current.children.iter().zip(&saved.children) {
        match (current_child, saved_child) {
            (NodeSnapshot::Describe(a), NodeSnapshot::Describe(b)) => compare_blocks(a, b)?,
            (NodeSnapshot::Test(a), NodeSnapshot::Test(b)) => {
                let mismatch = |field| ResumeMismatch {
                    path: a.path.clone(),
                    field,
                };
                if a.name != b.name {
                    return Err(mismatch("name"));
                }
                if a.path != b.path {
                    return Err(mismatch("path"));
                }
                if a.tags != b.tags {
                    return Err(mismatch("tags"));
                }
                if a.source != b.source {
                    return Err(mismatch("source"));
                }
                if a.mode != b.mode {
                    return Err(mismatch("mode"));
                }
                if a.ticks_before != b.ticks_before {
                    return Err(mismatch("ticks_before"));
                }
                if a.part_sources != b.part_sources {
                    return Err(mismatch("parts"));
                }
            }
            _ => return Err(mismatch("child kind")),
        }
    }
    Ok(())
}

/// Runs only after a full structural match, so shapes line up.
fn copy_forward(tree: &mut TestTree, block: BlockId, saved: &BlockSnapshot) {
    tree.block_mut(block).errors = saved.errors.clone();
    let children = tree.block(block).children.clone();
    for (child, saved_child) in children.into_iter().zip(&saved.children) {
        match (child, saved_child) {
            (NodeRef::Block(id), NodeSnapshot::Describe(saved_block)) => {
                copy_forward(tree, id, saved_block);
            }
            (NodeRef::Test(id), NodeSnapshot::Test(saved_test)) => {
                let test = tree.test_mut(id);
                test.errors = saved_test.errors.clone();
                test.profile.started_tick = saved_test.started_tick;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use super::*;
    use crate::tree::{Source, TestMode};
    use crate::runner::TestContext;

    fn suite(test_names: &[&str]) -> TestTree {
        let mut tree = TestTree::new(1);
        let block = tree.add_block(
            tree.root(),
            "suite".to_string(),
            Source::unknown(),
            TestMode::Normal,
            BTreeSet::new(),
        );
        for name in test_names {
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
    fn renamed_test_is_reported_at_its_path() {
        let saved = suite(&["a", "b"]);
        let rebuilt = suite(&["a", "renamed"]);
        let mismatch = compare_blocks(
            &BlockSnapshot::capture(&rebuilt, rebuilt.root()),
            &BlockSnapshot::capture(&saved, saved.root()),
        )
        .expect_err("mismatch");
        assert_eq!(mismatch.path, "suite > renamed");
        assert_eq!(mismatch.field, "name");
    }

    #[test]
    fn extra_child_is_reported_on_parent() {
        let saved = suite(&["a"]);
        let rebuilt = suite(&["a", "b"]);
        let mismatch = compare_blocks(
            &BlockSnapshot::capture(&rebuilt, rebuilt.root()),
            &BlockSnapshot::capture(&saved, saved.root()),
        )
        .expect_err("mismatch");
        assert_eq!(mismatch.path, "suite");
        assert_eq!(mismatch.field, "children");
    }

    #[test]
    fn errors_differ_without_mismatch_and_copy_forward() {
        let mut saved = suite(&["a"]);
        let a = saved.find_test("suite > a").expect("a");
        saved.test_mut(a).errors.push("before reload".to_string());
        let saved_snapshot = BlockSnapshot::capture(&saved, saved.root());

        let mut rebuilt = suite(&["a"]);
        let current = BlockSnapshot::capture(&rebuilt, rebuilt.root());
        compare_blocks(&current, &saved_snapshot).expect("structures match");
        let root = rebuilt.root();
        copy_forward(&mut rebuilt, root, &saved_snapshot);
        let a = rebuilt.find_test("suite > a").expect("a");
        assert_eq!(rebuilt.test(a).errors, vec!["before reload".to_string()]);
    }
}
