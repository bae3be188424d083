use std::collections::BTreeSet;

use regex::Regex;

use super::model::{BlockId, NodeRef, Test, TestMode, TestTree};
use crate::config::{Config, ConfigError};

/// Decides which registered tests are excluded from execution.
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    pattern: Option<Regex>,
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    focused: bool,
}

impl TestFilter {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let pattern = match &config.test_pattern {
            Some(raw) => Some(Regex::new(raw).map_err(|source| ConfigError::InvalidPattern {
                pattern: raw.clone(),
                source,
            })?),
            None => None,
        };
        Ok(Self {
            pattern,
            whitelist: config.tag_whitelist.iter().cloned().collect(),
            blacklist: config.tag_blacklist.iter().cloned().collect(),
            focused: false,
        })
    }

    pub fn has_focused_tests(&self) -> bool {
        self.focused
    }

    pub(crate) fn mark_focused(&mut self) {
        self.focused = true;
    }

    pub(crate) fn blacklist_tag(&mut self, tag: &str) {
        self.blacklist.insert(tag.to_string());
    }

    pub fn is_skipped(&self, test: &Test) -> bool {
        match test.mode {
            TestMode::Skip | TestMode::Todo => return true,
            TestMode::Only => {}
            TestMode::Normal if self.focused => return true,
            TestMode::Normal => {}
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&test.path) {
                return true;
            }
        }
        if !self.whitelist.is_empty() && test.tags.is_disjoint(&self.whitelist) {
            return true;
        }
        !test.tags.is_disjoint(&self.blacklist)
    }

    /// True when any test below `block` would run.
    pub fn has_any_test(&self, tree: &TestTree, block: BlockId) -> bool {
        tree.block(block).children.iter().any(|child| match *child {
            NodeRef::Test(id) => !self.is_skipped(tree.test(id)),
            NodeRef::Block(id) => self.has_any_test(tree, id),
        })
    }

    pub fn count_running_tests(&self, tree: &TestTree, block: BlockId) -> usize {
        if tree.block(block).mode == TestMode::Skip {
            return 0;
        }
        tree.block(block)
            .children
            .iter()
            .map(|child| match *child {
                NodeRef::Test(id) => usize::from(!self.is_skipped(tree.test(id))),
                NodeRef::Block(id) => self.count_running_tests(tree, id),
            })
            .sum()
    }
}
