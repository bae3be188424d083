use tracing::debug;

use super::event::TestEvent;
use super::pipeline::{ListenerContext, TestListener};

const NORMAL_GAME_SPEED: f64 = 1.0;

/// Speeds the host up for the run, turns autosave off, and calls the
/// configured before/after callbacks.
#[derive(Debug, Default)]
pub struct RunControl;

impl TestListener for RunControl {
    fn on_event(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>) {
        match event {
            TestEvent::TestRunStarted => {
                debug!(game_speed = cx.config.game_speed, "run_control_started");
                cx.host.set_game_speed(cx.config.game_speed);
                cx.host.set_autosave_enabled(false);
                if let Some(callback) = &cx.config.before_test_run {
                    callback.invoke();
                }
            }
            TestEvent::TestRunFinished => {
                cx.host.set_game_speed(NORMAL_GAME_SPEED);
                if let Some(callback) = &cx.config.after_test_run {
                    callback.invoke();
                }
            }
            TestEvent::LoadError => cx.host.set_game_speed(NORMAL_GAME_SPEED),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::config::Config;
    use crate::events::RunResults;
    use crate::host::ManualHost;
    use crate::tree::TestTree;

    #[test]
    fn speeds_up_and_restores_host() {
        let calls = Rc::new(Cell::new(0));
        let before = Rc::clone(&calls);
        let after = Rc::clone(&calls);
        let config = Config {
            game_speed: 64.0,
            ..Config::default()
        }
        .with_before_test_run(move || before.set(before.get() + 1))
        .with_after_test_run(move || after.set(after.get() + 10));
        let host = ManualHost::new();
        let tree = TestTree::new(1);
        let mut results = RunResults::default();
        let mut cx = ListenerContext {
            tree: &tree,
            config: &config,
            results: &mut results,
            host: &host,
            is_rerun: false,
        };

        RunControl.on_event(&TestEvent::TestRunStarted, &mut cx);
        assert_eq!(host.game_speed(), 64.0);
        assert!(!host.autosave_enabled());
        assert_eq!(calls.get(), 1);

        RunControl.on_event(&TestEvent::TestRunFinished, &mut cx);
        assert_eq!(host.game_speed(), 1.0);
        assert_eq!(calls.get(), 11);
    }
}
