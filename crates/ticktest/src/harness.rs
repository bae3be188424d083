use std::cell::{Ref, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigError};
use crate::events::{ListenerContext, RunResults, TestEvent, TestListener};
use crate::failure::IntoTestOutcome;
use crate::host::{EventRegistry, EventTap, Host, HostEvent, ManualHost, TapHandle};
use crate::persist::{PersistedStage, PersistentStore};
use crate::runner::{guarded, RunnerError, TestRunner};
use crate::setup::Registrar;
use crate::state::TestState;
use crate::tree::TestTree;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A named group of registrations, wrapped in its own top-level describe
/// block when loaded.
pub struct TestFile {
    name: String,
    register: Box<dyn FnOnce(&Registrar)>,
}

impl TestFile {
    pub fn new(name: impl Into<String>, register: impl FnOnce(&Registrar) + 'static) -> Self {
        Self {
            name: name.into(),
            register: Box::new(register),
        }
    }
}

/// One load of the framework: the registered tree plus the runner driving
/// it. A host reload drops the whole `Testbed` and loads a new one against
/// the same store.
pub struct Testbed {
    state: Rc<RefCell<TestState>>,
    runner: Option<TestRunner>,
    fatal_error: Option<RunnerError>,
}

impl Testbed {
    /// Builds the state, runs `register` to populate the tree, then closes
    /// registration.
    pub fn load<F, R>(
        config: Config,
        host: Rc<dyn Host>,
        store: Box<dyn PersistentStore>,
        register: F,
    ) -> Result<Self, LoadError>
    where
        F: FnOnce(&Registrar) -> R,
        R: IntoTestOutcome,
    {
        let state = Rc::new(RefCell::new(TestState::new(config, host, store)?));
        let capture = state.borrow().config.capture_backtraces;
        let registrar = Registrar::new(Rc::clone(&state));
        if let Err(message) = guarded::call(capture, || register(&registrar).into_outcome()) {
            let mut state = state.borrow_mut();
            let root = state.tree.root();
            state
                .tree
                .block_mut(root)
                .errors
                .push(format!("Error in definition: {message}"));
        }
        state.borrow_mut().close_registration();
        info!(stage = ?state.borrow().stage(), "testbed_loaded");
        Ok(Self {
            state,
            runner: None,
            fatal_error: None,
        })
    }

    /// Loads each file as a top-level describe block named after it.
    pub fn load_files(
        config: Config,
        host: Rc<dyn Host>,
        store: Box<dyn PersistentStore>,
        files: Vec<TestFile>,
    ) -> Result<Self, LoadError> {
        Self::load(config, host, store, move |registrar: &Registrar| {
            for file in files {
                debug!(file = %file.name, "test_file_loading");
                registrar.describe(file.name, file.register);
            }
        })
    }

    /// Creates the runner and unpauses the host. Does nothing if already
    /// started.
    pub fn start(&mut self) {
        if self.runner.is_some() {
            return;
        }
        self.state.borrow().host.set_tick_paused(false);
        self.runner = Some(TestRunner::new(Rc::clone(&self.state)));
    }

    /// Runs one tick of the test run and returns any fatal error. Ticks driven
    /// by [`attach_to_events`] keep that error for
    /// [`take_fatal_error`](Self::take_fatal_error) instead.
    pub fn advance(&mut self) -> Result<(), RunnerError> {
        let Some(runner) = self.runner.as_mut() else {
            return Ok(());
        };
        if runner.is_done() {
            return Ok(());
        }
        runner.tick().map_err(|error| {
            error!(%error, "test_runner_failed");
            error
        })
    }

    pub fn stage(&self) -> PersistedStage {
        self.state.borrow().stage()
    }

    pub fn results(&self) -> RunResults {
        self.state.borrow().results.clone()
    }

    pub fn tree(&self) -> Ref<'_, TestTree> {
        Ref::map(self.state.borrow(), |state| &state.tree)
    }

    pub fn is_started(&self) -> bool {
        self.runner.is_some()
    }

    /// True once the run reached its end, successfully or with a load error.
    pub fn is_finished(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(|runner| runner.is_done() && !runner.halted_for_reload())
    }

    /// True once a test asked the host to reload. This `Testbed` is spent;
    /// the host should load a new one.
    pub fn reload_requested(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(TestRunner::halted_for_reload)
    }

    /// Whether a run is in flight and should continue on this load.
    pub fn wants_to_run(&self) -> bool {
        matches!(
            self.stage(),
            PersistedStage::Running | PersistedStage::ToReload
        )
    }

    /// Appends a listener after the built-in ones.
    pub fn add_listener(&self, listener: impl TestListener + 'static) {
        self.state.borrow_mut().add_listener(Box::new(listener));
    }

    pub fn add_listener_fn<F>(&self, listener: F)
    where
        F: FnMut(&TestEvent, &mut ListenerContext<'_>) + 'static,
    {
        self.state.borrow_mut().add_listener(Box::new(listener));
    }

    /// Called with the new stage on every transition.
    pub fn on_stage_changed(&self, observer: impl FnMut(PersistedStage) + 'static) {
        self.state.borrow_mut().add_stage_observer(Box::new(observer));
    }

    pub fn fire_custom_event(&self, name: impl Into<String>, data: Value) {
        self.state.borrow_mut().raise_event(TestEvent::Custom {
            name: name.into(),
            data,
        });
    }

    pub fn take_fatal_error(&mut self) -> Option<RunnerError> {
        self.fatal_error.take()
    }

    /// Starts if needed, then advances once per host tick until the run
    /// finishes, a reload is requested, or `max_ticks` pass. Returns the
    /// number of ticks the host moved.
    pub fn run_until_idle(&mut self, host: &ManualHost, max_ticks: u64) -> Result<u64, RunnerError> {
        self.start();
        let mut ticks = 0;
        loop {
            self.advance()?;
            if self.is_finished() || self.reload_requested() || ticks >= max_ticks {
                return Ok(ticks);
            }
            host.advance_tick();
            ticks += 1;
        }
    }

    fn advance_from_event(&mut self) {
        if let Err(error) = self.advance() {
            self.fatal_error = Some(error);
        }
    }
}

/// Hooks a shared `Testbed` into the host's event registry.
///
/// A new game starts the run; a load that finds a run in flight continues it
/// on the next tick. The framework's tick handler is chained after the
/// host's own. The original handlers come back when the run ends or halts
/// for a reload, and when the returned tap is dropped.
pub fn attach_to_events(testbed: &Rc<RefCell<Testbed>>, registry: Rc<dyn EventRegistry>) -> EventTap {
    let tap = EventTap::new(registry);
    let handle = tap.handle();
    let weak = Rc::downgrade(testbed);

    let on_created = {
        let weak = Weak::clone(&weak);
        let handle = handle.clone();
        Rc::new(move |_event: HostEvent| run_tests(&weak, &handle))
    };
    tap.tap(HostEvent::GameCreated, on_created);

    let on_tick = {
        let handle = handle.clone();
        Rc::new(move |_event: HostEvent| try_continue(&weak, &handle))
    };
    tap.tap(HostEvent::Tick, on_tick);
    tap
}

fn run_tests(testbed: &Weak<RefCell<Testbed>>, handle: &TapHandle) {
    let Some(testbed) = testbed.upgrade() else {
        return;
    };
    testbed.borrow_mut().start();
    let weak = Rc::downgrade(&testbed);
    let handle_for_tick = handle.clone();
    handle.tap(
        HostEvent::Tick,
        Rc::new(move |_event: HostEvent| advance_tests(&weak, &handle_for_tick)),
    );
}

/// First tick after a load: keep going only if a run is in flight.
fn try_continue(testbed: &Weak<RefCell<Testbed>>, handle: &TapHandle) {
    let Some(shared) = testbed.upgrade() else {
        return;
    };
    let wants_to_run = shared.borrow().wants_to_run();
    if wants_to_run {
        run_tests(testbed, handle);
        advance_tests(testbed, handle);
    } else {
        handle.revert();
    }
}

fn advance_tests(testbed: &Weak<RefCell<Testbed>>, handle: &TapHandle) {
    let Some(testbed) = testbed.upgrade() else {
        handle.revert();
        return;
    };
    let mut testbed = testbed.borrow_mut();
    testbed.advance_from_event();
    if testbed.is_finished() || testbed.reload_requested() || testbed.fatal_error.is_some() {
        drop(testbed);
        handle.revert();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::events::RunStatus;
    use crate::host::EventBus;
    use crate::persist::MemoryStore;

    fn manual() -> (ManualHost, Rc<dyn Host>) {
        let host = ManualHost::new();
        let shared: Rc<dyn Host> = Rc::new(host.clone());
        (host, shared)
    }

    #[test]
    fn files_become_top_level_blocks() {
        let (_, host) = manual();
        let testbed = Testbed::load_files(
            Config::default(),
            host,
            Box::new(MemoryStore::new()),
            vec![
                TestFile::new("first.rs", |r: &Registrar| {
                    r.test("a", |_| ());
                }),
                TestFile::new("second.rs", |r: &Registrar| {
                    r.test("b", |_| ());
                }),
            ],
        )
        .expect("load");
        let tree = testbed.tree();
        assert!(tree.find_test("first.rs > a").is_some());
        assert!(tree.find_test("second.rs > b").is_some());
    }

    #[test]
    fn registration_closes_after_load() {
        let (_, host) = manual();
        let kept = Rc::new(RefCell::new(None));
        let kept_in = Rc::clone(&kept);
        let testbed = Testbed::load(Config::default(), host, Box::new(MemoryStore::new()), move |r: &Registrar| {
            *kept_in.borrow_mut() = Some(r.clone());
        })
        .expect("load");
        let late = kept.borrow_mut().take().expect("registrar");
        let outcome = guarded::call_quiet(|| late.test("late", |_| ()));
        assert_eq!(
            outcome.err().as_deref(),
            Some("Tests and hooks cannot be added/configured at this time")
        );
        assert_eq!(testbed.tree().test_count(), 0);
    }

    #[test]
    fn event_tap_runs_the_suite_then_restores_the_host_handler() {
        let (host, shared) = manual();
        let bus = EventBus::new();
        let host_ticks = Rc::new(Cell::new(0));
        let counter = Rc::clone(&host_ticks);
        bus.set_handler(HostEvent::Tick, Some(Rc::new(move |_: HostEvent| counter.set(counter.get() + 1))));

        let testbed = Testbed::load(Config::default(), shared, Box::new(MemoryStore::new()), |r: &Registrar| {
            r.test("waits", |cx| {
                cx.start_async();
                cx.after_ticks(3, |cx| cx.done());
            });
        })
        .expect("load");
        let testbed = Rc::new(RefCell::new(testbed));
        let tap = attach_to_events(&testbed, Rc::new(bus.clone()));

        bus.raise(HostEvent::GameCreated);
        for _ in 0..10 {
            bus.raise(HostEvent::Tick);
            host.advance_tick();
        }

        assert!(testbed.borrow().is_finished());
        assert_eq!(testbed.borrow().results().status, RunStatus::Passed);
        assert!(!tap.is_tapped(HostEvent::Tick));
        assert_eq!(host_ticks.get(), 10);
        assert!(!host.tick_paused());
    }

    #[test]
    fn fresh_load_without_run_reverts_on_first_tick() {
        let (_, shared) = manual();
        let bus = EventBus::new();
        let testbed = Testbed::load(Config::default(), shared, Box::new(MemoryStore::new()), |r: &Registrar| {
            r.test("never", |_| ());
        })
        .expect("load");
        let testbed = Rc::new(RefCell::new(testbed));
        let tap = attach_to_events(&testbed, Rc::new(bus.clone()));

        bus.raise(HostEvent::Tick);

        assert!(!testbed.borrow().is_started());
        assert!(!tap.is_tapped(HostEvent::Tick));
        assert!(bus.handler(HostEvent::Tick).is_none());
    }

    #[test]
    fn fatal_errors_are_kept_only_for_event_driven_ticks() {
        let (host, shared) = manual();
        host.set_player_count(2);
        let register = |r: &Registrar| {
            r.test("a", |_| ());
        };

        let mut direct =
            Testbed::load(Config::default(), Rc::clone(&shared), Box::new(MemoryStore::new()), register)
                .expect("load");
        direct.start();
        assert!(matches!(
            direct.advance(),
            Err(RunnerError::Multiplayer { players: 2 })
        ));
        assert!(direct.take_fatal_error().is_none());

        let bus = EventBus::new();
        let testbed = Testbed::load(Config::default(), shared, Box::new(MemoryStore::new()), register)
            .expect("load");
        let testbed = Rc::new(RefCell::new(testbed));
        let tap = attach_to_events(&testbed, Rc::new(bus.clone()));
        bus.raise(HostEvent::GameCreated);
        bus.raise(HostEvent::Tick);

        let kept = testbed.borrow_mut().take_fatal_error();
        assert!(matches!(kept, Some(RunnerError::Multiplayer { players: 2 })));
        assert!(testbed.borrow_mut().take_fatal_error().is_none());
        assert!(!tap.is_tapped(HostEvent::Tick));
    }
}
