mod event;
mod log;
mod pipeline;
mod results;
mod run_control;

pub use event::TestEvent;
pub use log::{LogLevel, LogSink, LoggingListener, TracingLogSink};
pub use pipeline::{EventPipeline, ListenerContext, TestListener};
pub use results::{ResultCollector, RunResults, RunStatus};
pub use run_control::RunControl;

use crate::config::Config;

/// Result collector, run control and logging, in that order.
pub fn builtin_pipeline(config: &Config) -> EventPipeline {
    let mut pipeline = EventPipeline::new();
    pipeline.push(ResultCollector);
    pipeline.push(RunControl);
    pipeline.push(LoggingListener::from_config(config));
    pipeline
}
