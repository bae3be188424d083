use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

mod tap;

pub use tap::{EventBus, EventHandler, EventRegistry, EventTap, HostEvent, TapHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadKind {
    Script,
    Mods,
}

/// The simulation the tests run inside.
///
/// Only `current_tick` and `request_reload` are required; the remaining
/// controls default to no-ops for hosts that lack them.
pub trait Host {
    fn current_tick(&self) -> u64;

    fn player_count(&self) -> usize {
        1
    }

    fn set_game_speed(&self, _speed: f64) {}

    fn set_autosave_enabled(&self, _enabled: bool) {}

    fn set_tick_paused(&self, _paused: bool) {}

    fn print(&self, _message: &str) {}

    /// Asks the host to tear down and rebuild all framework state. The host
    /// performs the reload after the current tick returns.
    fn request_reload(&self, kind: ReloadKind);
}

#[derive(Debug)]
struct ManualHostState {
    tick: u64,
    players: usize,
    game_speed: f64,
    autosave_enabled: bool,
    tick_paused: bool,
    printed: Vec<String>,
    pending_reload: Option<ReloadKind>,
}

impl Default for ManualHostState {
    fn default() -> Self {
        Self {
            tick: 0,
            players: 1,
            game_speed: 1.0,
            autosave_enabled: true,
            tick_paused: true,
            printed: Vec::new(),
            pending_reload: None,
        }
    }
}

/// A host whose clock is advanced by hand. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualHost {
    state: Rc<RefCell<ManualHostState>>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_tick(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.tick += 1;
        state.tick
    }

    pub fn set_tick(&self, tick: u64) {
        self.state.borrow_mut().tick = tick;
    }

    pub fn set_player_count(&self, players: usize) {
        self.state.borrow_mut().players = players;
    }

    pub fn game_speed(&self) -> f64 {
        self.state.borrow().game_speed
    }

    pub fn autosave_enabled(&self) -> bool {
        self.state.borrow().autosave_enabled
    }

    pub fn tick_paused(&self) -> bool {
        self.state.borrow().tick_paused
    }

    pub fn printed(&self) -> Vec<String> {
        self.state.borrow().printed.clone()
    }

    pub fn take_reload_request(&self) -> Option<ReloadKind> {
        self.state.borrow_mut().pending_reload.take()
    }
}

impl Host for ManualHost {
    fn current_tick(&self) -> u64 {
        self.state.borrow().tick
    }

    fn player_count(&self) -> usize {
        self.state.borrow().players
    }

    fn set_game_speed(&self, speed: f64) {
        self.state.borrow_mut().game_speed = speed;
    }

    fn set_autosave_enabled(&self, enabled: bool) {
        self.state.borrow_mut().autosave_enabled = enabled;
    }

    fn set_tick_paused(&self, paused: bool) {
        self.state.borrow_mut().tick_paused = paused;
    }

    fn print(&self, message: &str) {
        self.state.borrow_mut().printed.push(message.to_string());
    }

    fn request_reload(&self, kind: ReloadKind) {
        self.state.borrow_mut().pending_reload = Some(kind);
    }
}
