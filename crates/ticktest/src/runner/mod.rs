use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

mod context;
pub(crate) mod guarded;

pub use context::{IntoTickControl, OnTickHandle, TestContext, TickControl};

use crate::events::TestEvent;
use crate::persist::{prepare_reload, resume_after_reload, PersistedStage, ResumeError, StoreError};
use crate::state::TestState;
use crate::tree::{BlockId, HookFn, HookType, NodeRef, PartFn, TestId, TestMode};

const CHANGED_DURING_RELOAD: &str = "Mods files/tests were changed during reload. Aborting test run.";
const UNEXPECTED_RELOAD: &str = "Save was unexpectedly reloaded while tests were running. This will cause tests to break. Aborting test run";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("tests cannot be run with {players} players connected")]
    Multiplayer { players: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Init,
    EnterDescribe(BlockId),
    EnterTest(TestId),
    StartTest(TestId),
    RunTestPart,
    WaitForTestPart,
    LeaveTest,
    LeaveDescribe(BlockId),
    FinishTestRun,
}

#[derive(Debug, Clone, Copy)]
struct Scheduled {
    task: Task,
    wait_ticks: u32,
}

impl Task {
    fn now(self) -> Option<Scheduled> {
        self.after(0)
    }

    fn after(self, wait_ticks: u32) -> Option<Scheduled> {
        Some(Scheduled {
            task: self,
            wait_ticks,
        })
    }
}

type Step = Result<Option<Scheduled>, RunnerError>;

/// Walks the test tree as a chain of tasks, one host tick at a time.
///
/// Each [`tick`](Self::tick) runs tasks back to back until one asks to wait
/// or the walk ends. The active part's [`TestContext`] is owned here and lent
/// to user code; the shared state is never borrowed while user code runs.
pub struct TestRunner {
    state: Rc<RefCell<TestState>>,
    ticks_to_wait: u32,
    next_task: Option<Task>,
    run: Option<TestContext>,
    halted_for_reload: bool,
}

impl TestRunner {
    pub(crate) fn new(state: Rc<RefCell<TestState>>) -> Self {
        Self {
            state,
            ticks_to_wait: 0,
            next_task: Some(Task::Init),
            run: None,
            halted_for_reload: false,
        }
    }

    /// Advances the run by one host tick. A no-op once the walk is done.
    pub fn tick(&mut self) -> Result<(), RunnerError> {
        if self.ticks_to_wait > 0 {
            self.ticks_to_wait -= 1;
            if self.ticks_to_wait > 0 {
                return Ok(());
            }
        }
        while let Some(task) = self.next_task.take() {
            let Some(next) = self.run_task(task)? else {
                break;
            };
            self.next_task = Some(next.task);
            if next.wait_ticks > 0 {
                self.ticks_to_wait = next.wait_ticks;
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.next_task.is_none()
    }

    /// True after a test asked for a reload; the runner will not continue.
    pub fn halted_for_reload(&self) -> bool {
        self.halted_for_reload
    }

    fn run_task(&mut self, task: Task) -> Step {
        match task {
            Task::Init => self.init(),
            Task::EnterDescribe(block) => self.enter_describe(block),
            Task::EnterTest(test) => self.enter_test(test),
            Task::StartTest(test) => self.start_test(test),
            Task::RunTestPart => self.run_test_part(),
            Task::WaitForTestPart => self.wait_for_test_part(),
            Task::LeaveTest => self.leave_test(),
            Task::LeaveDescribe(block) => self.leave_describe(block),
            Task::FinishTestRun => self.finish_test_run(),
        }
    }

    fn init(&mut self) -> Step {
        let (players, stage) = {
            let state = self.state.borrow();
            (state.host.player_count(), state.stage())
        };
        if players > 1 {
            return Err(RunnerError::Multiplayer { players });
        }
        debug!(?stage, "test_runner_init");
        match stage {
            PersistedStage::NotRun | PersistedStage::LoadError => self.start_test_run(),
            PersistedStage::ToReload => self.attempt_resume(),
            PersistedStage::Running => self.load_error(UNEXPECTED_RELOAD.to_string()),
            PersistedStage::Finished => {
                self.state.borrow_mut().mark_rerun();
                info!("test_rerun_started");
                self.start_test_run()
            }
        }
    }

    fn start_test_run(&mut self) -> Step {
        let mut state = self.state.borrow_mut();
        let now = state.host.current_tick();
        state.run_start_tick = Some(now);
        state.set_stage(PersistedStage::Running)?;
        let total = state.filter.count_running_tests(&state.tree, state.tree.root());
        info!(tests = total, tick = now, "test_run_started");
        state.raise_event(TestEvent::TestRunStarted);
        Ok(Task::EnterDescribe(state.tree.root()).now())
    }

    fn attempt_resume(&mut self) -> Step {
        let resumed = resume_after_reload(&mut self.state.borrow_mut());
        let point = match resumed {
            Ok(point) => point,
            Err(error) => {
                warn!(%error, "test_resume_failed");
                let message = match error {
                    ResumeError::Mismatch(_) | ResumeError::UnknownTest(_) => {
                        CHANGED_DURING_RELOAD.to_string()
                    }
                    other => format!("Could not resume after reload: {other}. Aborting test run."),
                };
                return self.load_error(message);
            }
        };

        let mut state = self.state.borrow_mut();
        state.set_stage(PersistedStage::Running)?;
        state.active_test = Some(point.test);
        let now = state.host.current_tick();
        let test = state.tree.test(point.test);
        let part_count = test.parts.len();
        self.run = Some(TestContext::new(
            point.test,
            test.path.clone(),
            point.part_index,
            now,
            state.config.default_timeout,
        ));
        if point.part_index >= part_count {
            Ok(Task::LeaveTest.now())
        } else {
            Ok(Task::RunTestPart.now())
        }
    }

    fn load_error(&mut self, message: String) -> Step {
        let mut state = self.state.borrow_mut();
        state.set_stage(PersistedStage::LoadError)?;
        error!(%message, "test_load_error");
        state.results.additional_errors = vec![message];
        state.raise_event(TestEvent::LoadError);
        Ok(None)
    }

    fn enter_describe(&mut self, block: BlockId) -> Step {
        let (hooks, capture) = {
            let mut state = self.state.borrow_mut();
            state.raise_event(TestEvent::DescribeBlockEntered(block));
            if !state.tree.block(block).errors.is_empty() {
                return Ok(Task::LeaveDescribe(block).now());
            }
            if state.tree.block(block).children.is_empty() {
                state
                    .tree
                    .block_mut(block)
                    .errors
                    .push("No tests defined".to_string());
            }
            let hooks = if state.has_any_test(block) {
                block_hooks(&state, block, HookType::BeforeAll)
            } else {
                Vec::new()
            };
            (hooks, state.config.capture_backtraces)
        };
        for hook in hooks {
            if let Err(message) = guarded::call(capture, || hook()) {
                self.state
                    .borrow_mut()
                    .tree
                    .block_mut(block)
                    .errors
                    .push(format!("Error running {}: {message}", HookType::BeforeAll));
            }
        }
        Ok(self.next_in_block(block, 0))
    }

    fn enter_test(&mut self, test: TestId) -> Step {
        let mut state = self.state.borrow_mut();
        state.raise_event(TestEvent::TestEntered(test));
        if state.is_skipped(test) {
            let event = if state.tree.test(test).mode == TestMode::Todo {
                TestEvent::TestTodo(test)
            } else {
                TestEvent::TestSkipped(test)
            };
            state.raise_event(event);
            drop(state);
            return Ok(self.next_after_test(test));
        }
        Ok(Task::StartTest(test).after(state.tree.test(test).ticks_before))
    }

    fn start_test(&mut self, test: TestId) -> Step {
        let (hooks, capture) = {
            let mut state = self.state.borrow_mut();
            let now = state.host.current_tick();
            let default_timeout = state.config.default_timeout;
            let entry = state.tree.test_mut(test);
            entry.profile.started_tick = Some(now);
            let path = entry.path.clone();
            let parent = entry.parent;
            self.run = Some(TestContext::new(test, path, 0, now, default_timeout));
            state.active_test = Some(test);
            state.raise_event(TestEvent::TestStarted(test));
            let hooks: Vec<HookFn> = state
                .tree
                .ancestry(parent)
                .into_iter()
                .flat_map(|block| block_hooks(&state, block, HookType::BeforeEach))
                .collect();
            (hooks, state.config.capture_backtraces)
        };
        for hook in hooks {
            if !self.state.borrow().tree.test(test).errors.is_empty() {
                break;
            }
            if let Err(message) = guarded::call(capture, || hook()) {
                self.record_test_error(test, message);
            }
        }
        Ok(Task::RunTestPart.now())
    }

    fn run_test_part(&mut self) -> Step {
        let Some(mut run) = self.run.take() else {
            return Ok(None);
        };
        let test = run.test();
        let (part, capture, has_errors, now) = {
            let state = self.state.borrow();
            let entry = state.tree.test(test);
            let part: Option<PartFn> = entry
                .parts
                .get(run.part_index())
                .map(|part| Rc::clone(&part.func));
            (
                part,
                state.config.capture_backtraces,
                !entry.errors.is_empty(),
                state.host.current_tick(),
            )
        };
        run.set_now(now);
        if let (Some(part), false) = (part, has_errors) {
            if let Err(message) = guarded::call(capture, || part(&mut run)) {
                self.record_test_error(test, message);
            }
        }
        self.after_user_code(run)
    }

    fn wait_for_test_part(&mut self) -> Step {
        let Some(mut run) = self.run.take() else {
            return Ok(None);
        };
        let test = run.test();
        let (capture, now) = {
            let state = self.state.borrow();
            (state.config.capture_backtraces, state.host.current_tick())
        };
        run.set_now(now);
        let had_errors = !self.state.borrow().tree.test(test).errors.is_empty();
        if run.ticks_elapsed() > run.timeout() {
            let message = {
                let state = self.state.borrow();
                let entry = state.tree.test(test);
                let source = entry
                    .parts
                    .get(run.part_index())
                    .map(|part| part.source.to_string())
                    .unwrap_or_default();
                format!("Test timed out after {} ticks:\n{source}", run.timeout())
            };
            warn!(test = %run.test_path(), timeout = run.timeout(), "test_timed_out");
            self.record_test_error(test, message);
        }
        if !had_errors {
            if let Err(message) = run.run_tick_callbacks(capture) {
                self.record_test_error(test, message);
            }
        }
        self.after_user_code(run)
    }

    /// Handles a pending reload request, otherwise picks the task that
    /// follows the current part.
    fn after_user_code(&mut self, mut run: TestContext) -> Step {
        if let Some(kind) = run.take_reload_request() {
            let test = run.test();
            let part_index = run.part_index();
            let mut state = self.state.borrow_mut();
            prepare_reload(&mut state, test, part_index)?;
            info!(test = %run.test_path(), ?kind, "test_reload_requested");
            state.host.request_reload(kind);
            self.halted_for_reload = true;
            return Ok(None);
        }

        let state = self.state.borrow();
        let entry = state.tree.test(run.test());
        if !entry.errors.is_empty() {
            drop(state);
            self.run = Some(run);
            return Ok(Task::LeaveTest.now());
        }
        if !run.part_finished() {
            drop(state);
            self.run = Some(run);
            return Ok(Task::WaitForTestPart.after(1));
        }
        let part_count = entry.parts.len();
        let now = state.host.current_tick();
        drop(state);
        if run.part_index() + 1 < part_count {
            self.run = Some(run.into_next_part(now));
            Ok(Task::RunTestPart.now())
        } else {
            self.run = Some(run);
            Ok(Task::LeaveTest.now())
        }
    }

    fn leave_test(&mut self) -> Step {
        let Some(mut run) = self.run.take() else {
            return Ok(None);
        };
        let test = run.test();
        let capture = self.state.borrow().config.capture_backtraces;

        for after_test in run.take_after_test() {
            if let Err(message) = guarded::call(capture, after_test) {
                self.record_test_error(test, message);
            }
        }

        let hooks: Vec<HookFn> = {
            let state = self.state.borrow();
            state
                .tree
                .ancestry(state.tree.test(test).parent)
                .into_iter()
                .rev()
                .flat_map(|block| block_hooks(&state, block, HookType::AfterEach))
                .collect()
        };
        for hook in hooks {
            if let Err(message) = guarded::call(capture, || hook()) {
                self.record_test_error(test, message);
            }
        }

        {
            let mut state = self.state.borrow_mut();
            state.active_test = None;
            let now = state.host.current_tick();
            let entry = state.tree.test_mut(test);
            entry.profile.finished_tick = Some(now);
            let event = if entry.errors.is_empty() {
                TestEvent::TestPassed(test)
            } else {
                TestEvent::TestFailed(test)
            };
            state.raise_event(event);
        }
        Ok(self.next_after_test(test))
    }

    fn leave_describe(&mut self, block: BlockId) -> Step {
        let (hooks, capture) = {
            let state = self.state.borrow();
            let hooks = if state.has_any_test(block) {
                block_hooks(&state, block, HookType::AfterAll)
            } else {
                Vec::new()
            };
            (hooks, state.config.capture_backtraces)
        };
        for hook in hooks {
            if let Err(message) = guarded::call(capture, || hook()) {
                self.state
                    .borrow_mut()
                    .tree
                    .block_mut(block)
                    .errors
                    .push(format!("Error running {}: {message}", HookType::AfterAll));
            }
        }

        let mut state = self.state.borrow_mut();
        let event = if state.tree.block(block).errors.is_empty() {
            TestEvent::DescribeBlockFinished(block)
        } else {
            TestEvent::DescribeBlockFailed(block)
        };
        state.raise_event(event);
        let (parent, index) = {
            let entry = state.tree.block(block);
            (entry.parent, entry.index_in_parent)
        };
        drop(state);
        match parent {
            Some(parent) => Ok(self.next_in_block(parent, index + 1)),
            None => Ok(Task::FinishTestRun.now()),
        }
    }

    fn finish_test_run(&mut self) -> Step {
        let mut state = self.state.borrow_mut();
        state.set_stage(PersistedStage::Finished)?;
        state.raise_event(TestEvent::TestRunFinished);
        let results = &state.results;
        info!(
            ran = results.ran,
            passed = results.passed,
            failed = results.failed,
            skipped = results.skipped,
            todo = results.todo,
            status = ?results.status,
            "test_run_finished"
        );
        Ok(None)
    }

    fn next_after_test(&self, test: TestId) -> Option<Scheduled> {
        let (parent, index) = {
            let state = self.state.borrow();
            let entry = state.tree.test(test);
            (entry.parent, entry.index_in_parent)
        };
        self.next_in_block(parent, index + 1)
    }

    /// The child at `index`, or leaving the block once it has errors or no
    /// children remain.
    fn next_in_block(&self, block: BlockId, index: usize) -> Option<Scheduled> {
        let state = self.state.borrow();
        if !state.tree.block(block).errors.is_empty() {
            return Task::LeaveDescribe(block).now();
        }
        match state.tree.child(block, index) {
            Some(NodeRef::Block(child)) => Task::EnterDescribe(child).now(),
            Some(NodeRef::Test(child)) => Task::EnterTest(child).now(),
            None => Task::LeaveDescribe(block).now(),
        }
    }

    fn record_test_error(&self, test: TestId, message: String) {
        let mut state = self.state.borrow_mut();
        let entry = state.tree.test_mut(test);
        debug!(test = %entry.path, error = %message, "test_error_recorded");
        entry.errors.push(message);
    }
}

fn block_hooks(state: &TestState, block: BlockId, hook_type: HookType) -> Vec<HookFn> {
    state
        .tree
        .block(block)
        .hooks_of(hook_type)
        .map(|hook| Rc::clone(&hook.func))
        .collect()
}
