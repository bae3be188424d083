use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use thiserror::Error;
use ticktest::{
    attach_to_events, Config, EventBus, EventRegistry, FileStore, Host, HostEvent, LoadError,
    MemoryStore, PersistentStore, RunResults, RunnerError, StoreError, Testbed,
};
use tracing::{error, info};

use super::bootstrap::SimWiring;
use super::demo_suite::{demo_files, SharedWorld};
use super::sim_host::SimHost;
use super::world::World;

/// Where framework state survives a reload.
#[derive(Debug, Clone)]
pub(crate) enum StoreSource {
    Memory(MemoryStore),
    Dir(PathBuf),
}

impl StoreSource {
    fn open(&self) -> Result<Box<dyn PersistentStore>, StoreError> {
        Ok(match self {
            Self::Memory(store) => Box::new(store.clone()),
            Self::Dir(dir) => Box::new(FileStore::open(dir)?),
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum SimError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("test run did not finish within {max_ticks} ticks")]
    TickLimit { max_ticks: u64 },
}

#[derive(Debug)]
pub(crate) struct SimOutcome {
    pub(crate) results: RunResults,
    pub(crate) ticks: u64,
    pub(crate) loads: u32,
}

pub(crate) fn run(wiring: SimWiring) -> ExitCode {
    let outcome = match simulate(&wiring.config, &wiring.store, wiring.max_ticks) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "sim_failed");
            return ExitCode::FAILURE;
        }
    };
    info!(
        ticks = outcome.ticks,
        loads = outcome.loads,
        status = ?outcome.results.status,
        "sim_finished"
    );
    match serde_json::to_string_pretty(&outcome.results) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "results_encode_failed"),
    }
    if outcome.results.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Runs the demo suite to completion, rebuilding the framework from `store`
/// every time a test asks for a reload. The world and the tick clock carry
/// over between loads.
pub(crate) fn simulate(
    config: &Config,
    store: &StoreSource,
    max_ticks: u64,
) -> Result<SimOutcome, SimError> {
    let world: SharedWorld = Rc::new(RefCell::new(World::default()));
    let host = Rc::new(SimHost::default());
    let mut loads = 0;

    loop {
        loads += 1;
        let shared: Rc<dyn Host> = host.clone();
        let testbed =
            Testbed::load_files(config.clone(), shared, store.open()?, demo_files(&world))?;
        info!(load = loads, stage = ?testbed.stage(), "framework_loaded");
        let testbed = Rc::new(RefCell::new(testbed));

        let bus = EventBus::new();
        let stepper = Rc::clone(&world);
        let clock = Rc::clone(&host);
        bus.set_handler(
            HostEvent::Tick,
            Some(Rc::new(move |_: HostEvent| {
                if !clock.tick_paused() {
                    stepper.borrow_mut().step();
                }
            })),
        );
        let tap = attach_to_events(&testbed, Rc::new(bus.clone()));
        if loads == 1 {
            bus.raise(HostEvent::GameCreated);
        }

        let reload = loop {
            if host.current_tick() >= max_ticks {
                return Err(SimError::TickLimit { max_ticks });
            }
            bus.raise(HostEvent::Tick);
            host.advance_tick();
            if let Some(err) = testbed.borrow_mut().take_fatal_error() {
                return Err(err.into());
            }
            if let Some(kind) = host.take_reload_request() {
                break Some(kind);
            }
            if testbed.borrow().is_finished() {
                break None;
            }
        };
        drop(tap);

        match reload {
            Some(kind) => {
                info!(?kind, tick = host.current_tick(), "host_reloading");
                world.borrow_mut().note_reload();
            }
            None => {
                let results = testbed.borrow().results();
                return Ok(SimOutcome {
                    results,
                    ticks: host.current_tick(),
                    loads,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use ticktest::{ConfigError, PersistedStage, RunStatus};

    use super::*;

    #[test]
    fn demo_suite_survives_its_reload() {
        let outcome = simulate(
            &Config::default(),
            &StoreSource::Memory(MemoryStore::new()),
            10_000,
        )
        .expect("simulate");

        assert_eq!(outcome.loads, 2);
        assert_eq!(outcome.results.failed, 0, "{:?}", outcome.results);
        assert_eq!(outcome.results.passed, 9);
        assert_eq!(outcome.results.skipped, 1);
        assert_eq!(outcome.results.todo, 1);
        assert_eq!(outcome.results.status, RunStatus::Todo);
    }

    #[test]
    fn second_launch_reruns_without_no_rerun_tests() {
        let dir = TempDir::new().expect("tempdir");
        let store = StoreSource::Dir(dir.path().to_path_buf());

        let first = simulate(&Config::default(), &store, 10_000).expect("first launch");
        assert_eq!(first.results.passed, 9);
        let stage = FileStore::open(dir.path()).expect("reopen").stage();
        assert_eq!(stage, PersistedStage::Finished);

        let second = simulate(&Config::default(), &store, 10_000).expect("second launch");
        assert_eq!(second.results.passed, 8);
        assert_eq!(second.results.skipped, 2);
        assert!(second.results.is_success());
    }

    #[test]
    fn tick_limit_stops_a_stuck_run() {
        let err = simulate(
            &Config::default(),
            &StoreSource::Memory(MemoryStore::new()),
            5,
        )
        .expect_err("too few ticks");
        assert!(matches!(err, SimError::TickLimit { max_ticks: 5 }));
    }

    #[test]
    fn bad_pattern_fails_the_load() {
        let config = Config {
            test_pattern: Some("(".to_string()),
            ..Config::default()
        };
        let err = simulate(&config, &StoreSource::Memory(MemoryStore::new()), 100)
            .expect_err("invalid pattern");
        assert!(matches!(
            err,
            SimError::Load(LoadError::Config(ConfigError::InvalidPattern { .. }))
        ));
    }
}
