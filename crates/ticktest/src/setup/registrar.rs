use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use tracing::trace;

use super::each::expand_rows;
use crate::failure::{IntoTestOutcome, TestOutcome};
use crate::host::ReloadKind;
use crate::runner::{guarded, TestContext, TickControl};
use crate::state::TestState;
use crate::tree::{BlockId, Hook, HookFn, HookType, PartFn, Source, TestId, TestMode, TestPart};

/// Handle used by test files to build the describe/test tree.
///
/// Registration only happens while test files are loaded. Calling any of these
/// methods from inside a running test panics with a "cannot be nested inside
/// test" message, which is recorded as that test's error.
#[derive(Clone)]
pub struct Registrar {
    state: Rc<RefCell<TestState>>,
    mode: TestMode,
}

impl Registrar {
    pub(crate) fn new(state: Rc<RefCell<TestState>>) -> Self {
        Self {
            state,
            mode: TestMode::Normal,
        }
    }

    /// Registrar whose next `test`/`describe` is skipped.
    pub fn skip(&self) -> Self {
        self.with_mode(TestMode::Skip)
    }

    /// Registrar whose next `test`/`describe` is focused.
    pub fn only(&self) -> Self {
        self.with_mode(TestMode::Only)
    }

    fn with_mode(&self, mode: TestMode) -> Self {
        Self {
            state: Rc::clone(&self.state),
            mode,
        }
    }

    /// Adds a describe block and runs `body` right away to fill it. A failure
    /// in `body` marks the block failed; children added before it stay.
    #[track_caller]
    pub fn describe<F, R>(&self, name: impl Into<String>, body: F) -> BlockId
    where
        F: FnOnce(&Registrar) -> R,
        R: IntoTestOutcome,
    {
        self.describe_at(name.into(), Source::caller(), body)
    }

    #[track_caller]
    pub fn describe_each<T, F, R>(&self, rows: impl IntoIterator<Item = T>, name: &str, body: F)
    where
        T: Serialize,
        F: Fn(&Registrar, &T) -> R,
        R: IntoTestOutcome,
    {
        let source = Source::caller();
        let rows: Vec<T> = rows.into_iter().collect();
        let names = expand_rows(&rows, name).unwrap_or_else(|message| panic!("{message}"));
        for (row, name) in rows.iter().zip(names) {
            self.describe_at(name, source.clone(), |registrar| body(registrar, row));
        }
    }

    fn describe_at<F, R>(&self, name: String, source: Source, body: F) -> BlockId
    where
        F: FnOnce(&Registrar) -> R,
        R: IntoTestOutcome,
    {
        let (block, parent, capture) = {
            let mut state = self.state.borrow_mut();
            let parent = state.registration_block(|| format!("Describe block \"{name}\""));
            let parent_block = state.tree.block(parent);
            let mode = if parent_block.mode == TestMode::Skip {
                TestMode::Skip
            } else {
                self.mode
            };
            let mut tags = parent_block.tags.clone();
            tags.extend(state.pending_tags.take().unwrap_or_default());
            if mode == TestMode::Only {
                state.filter.mark_focused();
            }
            let block = state.tree.add_block(parent, name, source, mode, tags);
            state.current_block = Some(block);
            (block, parent, state.config.capture_backtraces)
        };

        let inner = Registrar::new(Rc::clone(&self.state));
        let outcome = guarded::call(capture, || body(&inner).into_outcome());

        let mut state = self.state.borrow_mut();
        if let Err(message) = outcome {
            state
                .tree
                .block_mut(block)
                .errors
                .push(format!("Error in definition: {message}"));
        }
        state.current_block = Some(parent);
        state.flush_pending_tags(block);
        state.tree.propagate_focus(block);
        trace!(path = %state.tree.block(block).path, "describe_block_registered");
        block
    }

    #[track_caller]
    pub fn test<F, R>(&self, name: impl Into<String>, body: F) -> TestBuilder
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        let test = self.create_test(name.into(), Source::caller(), part_fn(body), self.mode);
        TestBuilder {
            state: Rc::clone(&self.state),
            test,
        }
    }

    #[track_caller]
    pub fn it<F, R>(&self, name: impl Into<String>, body: F) -> TestBuilder
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.test(name, body)
    }

    /// A placeholder test that is reported as todo and never runs.
    #[track_caller]
    pub fn todo(&self, name: impl Into<String>) {
        self.create_test(
            name.into(),
            Source::caller(),
            part_fn(|_: &mut TestContext| ()),
            TestMode::Todo,
        );
    }

    /// One test per row, named by formatting `name` with the row's values.
    #[track_caller]
    pub fn test_each<T, F, R>(
        &self,
        rows: impl IntoIterator<Item = T>,
        name: &str,
        body: F,
    ) -> EachTestBuilder<T>
    where
        T: Serialize + 'static,
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        let source = Source::caller();
        let rows: Vec<T> = rows.into_iter().collect();
        let names = expand_rows(&rows, name).unwrap_or_else(|message| panic!("{message}"));
        let body = Rc::new(body);
        let tests = rows
            .into_iter()
            .zip(names)
            .map(|(row, name)| {
                let row = Rc::new(row);
                let test = self.create_test(
                    name,
                    source.clone(),
                    row_part_fn(Rc::clone(&body), Rc::clone(&row)),
                    self.mode,
                );
                (test, row)
            })
            .collect();
        EachTestBuilder {
            state: Rc::clone(&self.state),
            tests,
        }
    }

    pub fn before_all<F, R>(&self, func: F)
    where
        F: Fn() -> R + 'static,
        R: IntoTestOutcome,
    {
        self.add_hook(HookType::BeforeAll, hook_fn(func));
    }

    pub fn after_all<F, R>(&self, func: F)
    where
        F: Fn() -> R + 'static,
        R: IntoTestOutcome,
    {
        self.add_hook(HookType::AfterAll, hook_fn(func));
    }

    pub fn before_each<F, R>(&self, func: F)
    where
        F: Fn() -> R + 'static,
        R: IntoTestOutcome,
    {
        self.add_hook(HookType::BeforeEach, hook_fn(func));
    }

    pub fn after_each<F, R>(&self, func: F)
    where
        F: Fn() -> R + 'static,
        R: IntoTestOutcome,
    {
        self.add_hook(HookType::AfterEach, hook_fn(func));
    }

    /// Tags for the next `test` or `describe` in this block. Tags left unused
    /// at the end of the block are reported as a block error.
    pub fn tags<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.borrow_mut();
        let block = state.registration_block(|| "tags()".to_string());
        if state.pending_tags.is_some() {
            state
                .tree
                .block_mut(block)
                .errors
                .push("Double call to tags()".to_string());
        }
        state.pending_tags = Some(tags.into_iter().map(Into::into).collect());
    }

    /// Delay before each following test in this block. Nested blocks created
    /// afterwards inherit it.
    pub fn ticks_between_tests(&self, ticks: u32) {
        let mut state = self.state.borrow_mut();
        let block = state.registration_block(|| "ticks_between_tests()".to_string());
        state.tree.block_mut(block).ticks_between_tests = ticks;
    }

    fn add_hook(&self, hook_type: HookType, func: HookFn) {
        let mut state = self.state.borrow_mut();
        let block = state.registration_block(|| format!("Hook ({hook_type})"));
        state.tree.block_mut(block).hooks.push(Hook { hook_type, func });
    }

    fn create_test(&self, name: String, source: Source, func: PartFn, mode: TestMode) -> TestId {
        let mut state = self.state.borrow_mut();
        let parent = state.registration_block(|| format!("Test \"{name}\""));
        let parent_block = state.tree.block(parent);
        let mode = if parent_block.mode == TestMode::Skip && mode != TestMode::Todo {
            TestMode::Skip
        } else {
            mode
        };
        let mut tags = parent_block.tags.clone();
        tags.extend(state.pending_tags.take().unwrap_or_default());
        if mode == TestMode::Only {
            state.filter.mark_focused();
        }
        state.tree.add_test(parent, name, source, func, mode, tags)
    }
}

/// Adds more parts to a test just registered. Parts run in order; a part
/// starts once the previous one finished.
pub struct TestBuilder {
    state: Rc<RefCell<TestState>>,
    test: TestId,
}

impl TestBuilder {
    pub fn id(&self) -> TestId {
        self.test
    }

    #[track_caller]
    pub fn next<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        push_part(&self.state, self.test, Source::caller(), part_fn(func));
        self
    }

    /// Waits `ticks` ticks after the previous part, then runs `func`.
    #[track_caller]
    pub fn after_ticks<F, R>(self, ticks: u64, func: F) -> Self
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        let source = Source::caller();
        push_part(&self.state, self.test, source.clone(), wait_part(ticks));
        push_part(&self.state, self.test, source, part_fn(func));
        self
    }

    #[track_caller]
    pub fn after_script_reload<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.after_reload(ReloadKind::Script, Source::caller(), part_fn(func))
    }

    #[track_caller]
    pub fn after_mod_reload<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.after_reload(ReloadKind::Mods, Source::caller(), part_fn(func))
    }

    fn after_reload(self, kind: ReloadKind, source: Source, func: PartFn) -> Self {
        push_part(&self.state, self.test, source.clone(), reload_part(kind));
        push_part(&self.state, self.test, source, func);
        add_tag(&self.state, self.test, reload_tag(kind));
        self
    }
}

/// Builder for the tests created by one `test_each` call. Each added part
/// receives the row its test was created from.
pub struct EachTestBuilder<T> {
    state: Rc<RefCell<TestState>>,
    tests: Vec<(TestId, Rc<T>)>,
}

impl<T: 'static> EachTestBuilder<T> {
    pub fn ids(&self) -> Vec<TestId> {
        self.tests.iter().map(|(test, _)| *test).collect()
    }

    #[track_caller]
    pub fn next<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.next_at(Source::caller(), func)
    }

    #[track_caller]
    pub fn after_ticks<F, R>(self, ticks: u64, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        let source = Source::caller();
        for (test, _) in &self.tests {
            push_part(&self.state, *test, source.clone(), wait_part(ticks));
        }
        self.next_at(source, func)
    }

    #[track_caller]
    pub fn after_script_reload<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.after_reload(ReloadKind::Script, Source::caller(), func)
    }

    #[track_caller]
    pub fn after_mod_reload<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        self.after_reload(ReloadKind::Mods, Source::caller(), func)
    }

    fn after_reload<F, R>(self, kind: ReloadKind, source: Source, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        for (test, _) in &self.tests {
            push_part(&self.state, *test, source.clone(), reload_part(kind));
            add_tag(&self.state, *test, reload_tag(kind));
        }
        self.next_at(source, func)
    }

    fn next_at<F, R>(self, source: Source, func: F) -> Self
    where
        F: Fn(&mut TestContext, &T) -> R + 'static,
        R: IntoTestOutcome,
    {
        let func = Rc::new(func);
        for (test, row) in &self.tests {
            let part = row_part_fn(Rc::clone(&func), Rc::clone(row));
            push_part(&self.state, *test, source.clone(), part);
        }
        self
    }
}

fn part_fn<F, R>(body: F) -> PartFn
where
    F: Fn(&mut TestContext) -> R + 'static,
    R: IntoTestOutcome,
{
    Rc::new(move |cx: &mut TestContext| body(cx).into_outcome())
}

fn row_part_fn<T, F, R>(body: Rc<F>, row: Rc<T>) -> PartFn
where
    T: 'static,
    F: Fn(&mut TestContext, &T) -> R + 'static,
    R: IntoTestOutcome,
{
    Rc::new(move |cx: &mut TestContext| (*body)(cx, &*row).into_outcome())
}

fn hook_fn<F, R>(func: F) -> HookFn
where
    F: Fn() -> R + 'static,
    R: IntoTestOutcome,
{
    Rc::new(move || func().into_outcome())
}

fn wait_part(ticks: u64) -> PartFn {
    Rc::new(move |cx: &mut TestContext| -> TestOutcome {
        cx.start_async();
        cx.after_ticks(ticks, |cx| cx.done());
        Ok(())
    })
}

/// One tick after it starts, asks the host for a reload.
fn reload_part(kind: ReloadKind) -> PartFn {
    Rc::new(move |cx: &mut TestContext| -> TestOutcome {
        cx.start_async_with_timeout(1);
        cx.on_tick(move |cx, _| {
            cx.request_reload(kind);
            TickControl::Remove
        });
        Ok(())
    })
}

fn reload_tag(kind: ReloadKind) -> &'static str {
    match kind {
        ReloadKind::Script => "after_script_reload",
        ReloadKind::Mods => "after_mod_reload",
    }
}

fn push_part(state: &RefCell<TestState>, test: TestId, source: Source, func: PartFn) {
    let mut state = state.borrow_mut();
    state.registration_block(|| "Test part".to_string());
    state.tree.test_mut(test).parts.push(TestPart { source, func });
}

fn add_tag(state: &RefCell<TestState>, test: TestId, tag: &str) {
    state
        .borrow_mut()
        .tree
        .test_mut(test)
        .tags
        .insert(tag.to_string());
}
