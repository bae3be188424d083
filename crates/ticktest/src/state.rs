use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::config::{Config, ConfigError};
use crate::events::{
    builtin_pipeline, EventPipeline, ListenerContext, RunResults, TestEvent, TestListener,
};
use crate::host::Host;
use crate::persist::{PersistedStage, PersistentStore, StoreError};
use crate::runner::guarded;
use crate::tree::{BlockId, TestFilter, TestId, TestTree};

pub(crate) const NO_RERUN_TAG: &str = "no_rerun";

pub(crate) type StageObserver = Box<dyn FnMut(PersistedStage)>;

/// All framework state for one load: the tree, the registration cursor, the
/// run tally and the host-facing collaborators. Owned behind one
/// `Rc<RefCell<_>>` shared by the registrar and the runner; no borrow of it is
/// held while user code runs, apart from listeners and stage observers.
pub(crate) struct TestState {
    pub(crate) config: Config,
    pub(crate) filter: TestFilter,
    pub(crate) tree: TestTree,
    pub(crate) current_block: Option<BlockId>,
    pub(crate) pending_tags: Option<BTreeSet<String>>,
    pub(crate) active_test: Option<TestId>,
    pub(crate) results: RunResults,
    pub(crate) is_rerun: bool,
    pub(crate) run_start_tick: Option<u64>,
    pub(crate) host: Rc<dyn Host>,
    store: Box<dyn PersistentStore>,
    pipeline: EventPipeline,
    stage_observers: Vec<StageObserver>,
}

impl TestState {
    pub(crate) fn new(
        config: Config,
        host: Rc<dyn Host>,
        store: Box<dyn PersistentStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let filter = TestFilter::from_config(&config)?;
        let tree = TestTree::new(config.default_ticks_between_tests);
        let root = tree.root();
        let pipeline = builtin_pipeline(&config);
        Ok(Self {
            config,
            filter,
            tree,
            current_block: Some(root),
            pending_tags: None,
            active_test: None,
            results: RunResults::default(),
            is_rerun: false,
            run_start_tick: None,
            host,
            store,
            pipeline,
            stage_observers: Vec::new(),
        })
    }

    pub(crate) fn stage(&self) -> PersistedStage {
        self.store.stage()
    }

    pub(crate) fn set_stage(&mut self, stage: PersistedStage) -> Result<(), StoreError> {
        self.store.set_stage(stage)?;
        debug!(?stage, "test_stage_changed");
        for (index, observer) in self.stage_observers.iter_mut().enumerate() {
            if let Err(message) = guarded::call_quiet(|| observer(stage)) {
                warn!(observer = index, ?stage, error = %message, "stage_observer_panicked");
            }
        }
        Ok(())
    }

    pub(crate) fn store_mut(&mut self) -> &mut dyn PersistentStore {
        self.store.as_mut()
    }

    pub(crate) fn add_listener(&mut self, listener: Box<dyn TestListener>) {
        self.pipeline.push_boxed(listener);
    }

    pub(crate) fn add_stage_observer(&mut self, observer: StageObserver) {
        self.stage_observers.push(observer);
    }

    pub(crate) fn raise_event(&mut self, event: TestEvent) {
        let Self {
            pipeline,
            tree,
            config,
            results,
            host,
            is_rerun,
            ..
        } = self;
        let mut cx = ListenerContext {
            tree,
            config,
            results,
            host: &**host,
            is_rerun: *is_rerun,
        };
        pipeline.raise(&event, &mut cx);
    }

    /// Flags the run as a rerun; `no_rerun` tests stay out of it, including
    /// after a resume.
    pub(crate) fn mark_rerun(&mut self) {
        self.filter.blacklist_tag(NO_RERUN_TAG);
        self.is_rerun = true;
    }

    pub(crate) fn is_skipped(&self, test: TestId) -> bool {
        self.filter.is_skipped(self.tree.test(test))
    }

    pub(crate) fn has_any_test(&self, block: BlockId) -> bool {
        self.filter.has_any_test(&self.tree, block)
    }

    /// Reports tags that no test or block picked up as an error on `block`.
    pub(crate) fn flush_pending_tags(&mut self, block: BlockId) {
        let Some(tags) = self.pending_tags.take() else {
            return;
        };
        let tags: Vec<String> = tags.iter().map(|tag| format!("{tag:?}")).collect();
        self.tree.block_mut(block).errors.push(format!(
            "Tags not added to any test or describe block: {{{}}}",
            tags.join(", ")
        ));
    }

    /// Ends the registration phase; later registrations panic.
    pub(crate) fn close_registration(&mut self) {
        let root = self.tree.root();
        self.flush_pending_tags(root);
        self.current_block = None;
        debug!(
            tests = self.tree.test_count(),
            focused = self.filter.has_focused_tests(),
            "test_registration_closed"
        );
    }

    /// Block that new registrations attach to.
    ///
    /// # Panics
    ///
    /// Panics while a test is running or once registration has closed. Inside
    /// a running test the panic is caught and recorded as that test's error.
    #[track_caller]
    pub(crate) fn registration_block(&self, what: impl FnOnce() -> String) -> BlockId {
        if let Some(active) = self.active_test {
            panic!(
                "{} cannot be nested inside test \"{}\"",
                what(),
                self.tree.test(active).path
            );
        }
        match self.current_block {
            Some(block) => block,
            None => panic!("Tests and hooks cannot be added/configured at this time"),
        }
    }
}
