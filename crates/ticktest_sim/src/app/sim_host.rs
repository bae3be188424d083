use std::cell::Cell;

use ticktest::{Host, ReloadKind};
use tracing::{debug, info};

/// Host side of the simulation: the tick clock and the game controls the
/// framework may touch.
#[derive(Debug)]
pub(crate) struct SimHost {
    tick: Cell<u64>,
    game_speed: Cell<f64>,
    autosave_enabled: Cell<bool>,
    tick_paused: Cell<bool>,
    pending_reload: Cell<Option<ReloadKind>>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self {
            tick: Cell::new(0),
            game_speed: Cell::new(1.0),
            autosave_enabled: Cell::new(true),
            tick_paused: Cell::new(true),
            pending_reload: Cell::new(None),
        }
    }
}

impl SimHost {
    pub(crate) fn advance_tick(&self) -> u64 {
        let next = self.tick.get() + 1;
        self.tick.set(next);
        next
    }

    pub(crate) fn take_reload_request(&self) -> Option<ReloadKind> {
        self.pending_reload.take()
    }

    pub(crate) fn tick_paused(&self) -> bool {
        self.tick_paused.get()
    }
}

impl Host for SimHost {
    fn current_tick(&self) -> u64 {
        self.tick.get()
    }

    fn set_game_speed(&self, speed: f64) {
        debug!(speed, "host_game_speed_set");
        self.game_speed.set(speed);
    }

    fn set_autosave_enabled(&self, enabled: bool) {
        self.autosave_enabled.set(enabled);
    }

    fn set_tick_paused(&self, paused: bool) {
        debug!(paused, "host_tick_paused_set");
        self.tick_paused.set(paused);
    }

    fn print(&self, message: &str) {
        info!(%message, "host_print");
    }

    fn request_reload(&self, kind: ReloadKind) {
        self.pending_reload.set(Some(kind));
    }
}
