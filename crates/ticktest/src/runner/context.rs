use std::fmt;

use super::guarded;
use crate::failure::{IntoTestOutcome, TestFailure, TestOutcome};
use crate::host::ReloadKind;
use crate::tree::TestId;

/// What an `on_tick` callback wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Remove,
}

/// Return types accepted from `on_tick` callbacks. `false` removes the
/// callback, as does [`TickControl::Remove`].
pub trait IntoTickControl {
    fn into_tick_control(self) -> Result<TickControl, TestFailure>;
}

impl IntoTickControl for () {
    fn into_tick_control(self) -> Result<TickControl, TestFailure> {
        Ok(TickControl::Continue)
    }
}

impl IntoTickControl for bool {
    fn into_tick_control(self) -> Result<TickControl, TestFailure> {
        Ok(if self {
            TickControl::Continue
        } else {
            TickControl::Remove
        })
    }
}

impl IntoTickControl for TickControl {
    fn into_tick_control(self) -> Result<TickControl, TestFailure> {
        Ok(self)
    }
}

impl<T: IntoTickControl> IntoTickControl for Result<T, TestFailure> {
    fn into_tick_control(self) -> Result<TickControl, TestFailure> {
        self?.into_tick_control()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnTickHandle(u64);

type TickFn = Box<dyn FnMut(&mut TestContext, u64) -> Result<TickControl, TestFailure>>;
pub(crate) type AfterTestFn = Box<dyn FnOnce() -> TestOutcome>;

struct OnTickEntry {
    handle: OnTickHandle,
    func: Option<TickFn>,
    removed: bool,
}

/// The running part of a test, handed to its body and to every callback the
/// body registers.
///
/// Misusing the context (a second `start_async`, `done` on a test that is
/// not async, `on_tick` outside an async test) panics; the panic is caught at
/// the test boundary and recorded as the test's error.
pub struct TestContext {
    test: TestId,
    test_path: String,
    part_index: usize,
    now: u64,
    tick_started: u64,
    default_timeout: u64,
    is_async: bool,
    async_done: bool,
    timeout: u64,
    on_tick: Vec<OnTickEntry>,
    next_handle: u64,
    after_test: Vec<AfterTestFn>,
    reload_request: Option<ReloadKind>,
}

impl TestContext {
    pub(crate) fn new(
        test: TestId,
        test_path: String,
        part_index: usize,
        now: u64,
        default_timeout: u64,
    ) -> Self {
        Self {
            test,
            test_path,
            part_index,
            now,
            tick_started: now,
            default_timeout,
            is_async: false,
            async_done: false,
            timeout: default_timeout,
            on_tick: Vec::new(),
            next_handle: 0,
            after_test: Vec::new(),
            reload_request: None,
        }
    }

    /// Marks the current part async with the configured default timeout.
    #[track_caller]
    pub fn start_async(&mut self) {
        self.start_async_with_timeout(self.default_timeout);
    }

    #[track_caller]
    pub fn start_async_with_timeout(&mut self, timeout: u64) {
        if self.is_async {
            panic!("test is already async");
        }
        if timeout < 1 {
            panic!("test timeout must be greater than 0");
        }
        self.is_async = true;
        self.timeout = timeout;
    }

    /// Lets the part finish once this tick's callbacks have run.
    #[track_caller]
    pub fn done(&mut self) {
        if !self.is_async {
            panic!("\"done\" can only be used when test is async");
        }
        if self.async_done {
            panic!("async test is already marked as done");
        }
        self.async_done = true;
    }

    /// Registers `func` to run once per tick from the next tick on. The
    /// second argument is the number of ticks since the part started.
    #[track_caller]
    pub fn on_tick<F, R>(&mut self, mut func: F) -> OnTickHandle
    where
        F: FnMut(&mut TestContext, u64) -> R + 'static,
        R: IntoTickControl,
    {
        if !self.is_async {
            panic!("on_tick can only be used in async tests");
        }
        let handle = OnTickHandle(self.next_handle);
        self.next_handle += 1;
        self.on_tick.push(OnTickEntry {
            handle,
            func: Some(Box::new(move |cx, tick| func(cx, tick).into_tick_control())),
            removed: false,
        });
        handle
    }

    pub fn remove_on_tick(&mut self, handle: OnTickHandle) {
        if let Some(entry) = self.on_tick.iter_mut().find(|entry| entry.handle == handle) {
            entry.removed = true;
        }
    }

    /// Runs `func` once `ticks` ticks have passed, counted from now.
    #[track_caller]
    pub fn after_ticks<F, R>(&mut self, ticks: u64, func: F) -> OnTickHandle
    where
        F: FnOnce(&mut TestContext) -> R + 'static,
        R: IntoTestOutcome,
    {
        if !self.is_async {
            panic!("after_ticks can only be used in async tests");
        }
        if ticks < 1 {
            panic!("after_ticks amount must be positive");
        }
        let finish_tick = self.ticks_elapsed() + ticks;
        let mut func = Some(func);
        self.on_tick(move |cx, tick| -> Result<TickControl, TestFailure> {
            if tick < finish_tick {
                return Ok(TickControl::Continue);
            }
            if let Some(func) = func.take() {
                func(cx).into_outcome()?;
            }
            Ok(TickControl::Remove)
        })
    }

    /// Cleanup that runs when the test leaves, before `afterEach` hooks, even
    /// when the test failed.
    pub fn after_test<F, R>(&mut self, func: F)
    where
        F: FnOnce() -> R + 'static,
        R: IntoTestOutcome,
    {
        self.after_test.push(Box::new(move || func().into_outcome()));
    }

    /// Asks for a reload once the current callback returns. The test resumes
    /// at its next part afterwards.
    pub fn request_reload(&mut self, kind: ReloadKind) {
        self.reload_request = Some(kind);
    }

    pub fn test_path(&self) -> &str {
        &self.test_path
    }

    /// Current host tick.
    pub fn tick(&self) -> u64 {
        self.now
    }

    pub fn ticks_elapsed(&self) -> u64 {
        self.now.saturating_sub(self.tick_started)
    }

    pub fn part_index(&self) -> usize {
        self.part_index
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub(crate) fn test(&self) -> TestId {
        self.test
    }

    pub(crate) fn set_now(&mut self, now: u64) {
        self.now = now;
    }

    pub(crate) fn timeout(&self) -> u64 {
        self.timeout
    }

    /// True once nothing keeps the part waiting.
    pub(crate) fn part_finished(&self) -> bool {
        !self.is_async || self.async_done
    }

    pub(crate) fn take_reload_request(&mut self) -> Option<ReloadKind> {
        self.reload_request.take()
    }

    pub(crate) fn take_after_test(&mut self) -> Vec<AfterTestFn> {
        std::mem::take(&mut self.after_test)
    }

    /// Context for the following part. Only `after_test` callbacks carry over.
    pub(crate) fn into_next_part(mut self, now: u64) -> Self {
        let mut next = Self::new(
            self.test,
            std::mem::take(&mut self.test_path),
            self.part_index + 1,
            now,
            self.default_timeout,
        );
        next.after_test = self.take_after_test();
        next
    }

    /// Runs the callbacks registered before this tick, in registration order.
    /// Stops at the first failure. Callbacks added while these run wait for
    /// the next tick.
    pub(crate) fn run_tick_callbacks(&mut self, capture_trace: bool) -> Result<(), String> {
        let tick = self.ticks_elapsed();
        let handles: Vec<OnTickHandle> = self
            .on_tick
            .iter()
            .filter(|entry| !entry.removed)
            .map(|entry| entry.handle)
            .collect();
        let mut outcome = Ok(());
        for handle in handles {
            let Some(index) = self.entry_index(handle) else {
                continue;
            };
            if self.on_tick[index].removed {
                continue;
            }
            let Some(mut func) = self.on_tick[index].func.take() else {
                continue;
            };
            let result = guarded::call(capture_trace, || func(self, tick));
            if let Some(index) = self.entry_index(handle) {
                let entry = &mut self.on_tick[index];
                match result {
                    Ok(TickControl::Remove) => entry.removed = true,
                    _ => entry.func = Some(func),
                }
            }
            if let Err(message) = result {
                outcome = Err(message);
                break;
            }
            if self.reload_request.is_some() {
                break;
            }
        }
        self.on_tick.retain(|entry| !entry.removed);
        outcome
    }

    fn entry_index(&self, handle: OnTickHandle) -> Option<usize> {
        self.on_tick.iter().position(|entry| entry.handle == handle)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test_path", &self.test_path)
            .field("part_index", &self.part_index)
            .field("is_async", &self.is_async)
            .field("async_done", &self.async_done)
            .field("timeout", &self.timeout)
            .field("on_tick", &self.on_tick.len())
            .finish_non_exhaustive()
    }
}
