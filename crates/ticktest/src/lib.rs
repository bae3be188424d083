pub mod config;
pub mod events;
pub mod failure;
mod harness;
pub mod host;
pub mod persist;
pub mod runner;
mod setup;
mod state;
pub mod tree;

pub use config::{Config, ConfigError, RunCallback};
pub use events::{
    EventPipeline, ListenerContext, LogLevel, LogSink, RunResults, RunStatus, TestEvent,
    TestListener,
};
pub use failure::{IntoTestOutcome, TestFailure, TestOutcome};
pub use harness::{attach_to_events, LoadError, TestFile, Testbed};
pub use host::{
    EventBus, EventRegistry, EventTap, Host, HostEvent, ManualHost, ReloadKind, TapHandle,
};
pub use persist::{FileStore, MemoryStore, PersistedStage, PersistentStore, StoreError};
pub use runner::{IntoTickControl, OnTickHandle, RunnerError, TestContext, TestRunner, TickControl};
pub use setup::{EachTestBuilder, Registrar, TestBuilder};
pub use tree::{BlockId, TestId, TestMode, TestTree};

/// Directory the file-backed store keeps its state in.
pub const STATE_DIR_ENV_VAR: &str = "TICKTEST_STATE_DIR";
/// Optional path to a JSON config file.
pub const CONFIG_ENV_VAR: &str = "TICKTEST_CONFIG";
