use tracing::{debug, error, info, trace, warn};

use super::event::TestEvent;
use super::pipeline::{ListenerContext, TestListener};
use super::results::RunStatus;
use crate::config::Config;
use crate::host::Host;
use crate::tree::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub trait LogSink {
    fn log(&mut self, level: LogLevel, message: &str, source: Option<&Source>);
}

/// Forwards result lines to `tracing`; the subscriber's filter decides
/// what is shown.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&mut self, level: LogLevel, message: &str, source: Option<&Source>) {
        let source = source.map(ToString::to_string);
        let source = source.as_deref().unwrap_or("");
        match level {
            LogLevel::Trace => trace!(source, "{message}"),
            LogLevel::Debug => debug!(source, "{message}"),
            LogLevel::Info => info!(source, "{message}"),
            LogLevel::Warn => warn!(source, "{message}"),
            LogLevel::Error => error!(source, "{message}"),
        }
    }
}

/// Formats lifecycle events into human-readable lines.
pub struct LoggingListener {
    sinks: Vec<Box<dyn LogSink>>,
    log_to_game: bool,
    log_passed_tests: bool,
    log_skipped_tests: bool,
}

impl LoggingListener {
    pub fn from_config(config: &Config) -> Self {
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
        if config.log_to_tracing {
            sinks.push(Box::new(TracingLogSink));
        }
        Self {
            sinks,
            log_to_game: config.log_to_game,
            log_passed_tests: config.log_passed_tests,
            log_skipped_tests: config.log_skipped_tests,
        }
    }

    pub fn with_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    fn emit(&mut self, host: &dyn Host, level: LogLevel, message: &str, source: Option<&Source>) {
        for sink in &mut self.sinks {
            sink.log(level, message, source);
        }
        if self.log_to_game && level >= LogLevel::Info {
            host.print(message);
        }
    }
}

impl TestListener for LoggingListener {
    fn on_event(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>) {
        let host = cx.host;
        match event {
            TestEvent::TestRunStarted => {
                let message = if cx.is_rerun {
                    "Test run started (rerun)"
                } else {
                    "Test run started"
                };
                self.emit(host, LogLevel::Debug, message, None);
            }
            TestEvent::DescribeBlockEntered(id) => {
                let block = cx.tree.block(*id);
                if block.parent.is_some() {
                    let message = format!("BLOCK: {}", block.path);
                    self.emit(host, LogLevel::Trace, &message, Some(&block.source));
                }
            }
            TestEvent::TestStarted(id) => {
                let test = cx.tree.test(*id);
                let message = format!("TEST:  {}", test.path);
                self.emit(host, LogLevel::Trace, &message, Some(&test.source));
            }
            TestEvent::TestPassed(id) if self.log_passed_tests => {
                let test = cx.tree.test(*id);
                let message = match test.profile.duration_ticks() {
                    Some(ticks) => format!("PASS: {} ({ticks} ticks)", test.path),
                    None => format!("PASS: {}", test.path),
                };
                self.emit(host, LogLevel::Info, &message, Some(&test.source));
            }
            TestEvent::TestFailed(id) => {
                let test = cx.tree.test(*id);
                let message = format!("Test failed: {}", test.path);
                self.emit(host, LogLevel::Error, &message, Some(&test.source));
                for error in &test.errors {
                    self.emit(host, LogLevel::Error, error, None);
                }
            }
            TestEvent::TestSkipped(id) if self.log_skipped_tests => {
                let test = cx.tree.test(*id);
                let message = format!("SKIPPED: {}", test.path);
                self.emit(host, LogLevel::Info, &message, Some(&test.source));
            }
            TestEvent::TestTodo(id) => {
                let test = cx.tree.test(*id);
                let message = format!("TODO: {}", test.path);
                self.emit(host, LogLevel::Warn, &message, Some(&test.source));
            }
            TestEvent::DescribeBlockFinished(id) => {
                let block = cx.tree.block(*id);
                if block.parent.is_some() {
                    let message = format!("END BLOCK: {}", block.path);
                    self.emit(host, LogLevel::Trace, &message, Some(&block.source));
                }
            }
            TestEvent::DescribeBlockFailed(id) => {
                let block = cx.tree.block(*id);
                let label = if block.parent.is_some() {
                    block.path.as_str()
                } else {
                    "<root>"
                };
                let message = format!("Error in describe block: {label}");
                self.emit(host, LogLevel::Error, &message, Some(&block.source));
                for error in &block.errors {
                    self.emit(host, LogLevel::Error, error, None);
                }
            }
            TestEvent::TestRunFinished => {
                let results = &*cx.results;
                if !results.additional_errors.is_empty() {
                    self.emit(host, LogLevel::Error, "There are additional errors:", None);
                    for error in &results.additional_errors {
                        self.emit(host, LogLevel::Error, error, None);
                    }
                }
                let summary = format!(
                    "ran {}, passed {}, failed {}, skipped {}, todo {}, describe block errors {}",
                    results.ran,
                    results.passed,
                    results.failed,
                    results.skipped,
                    results.todo,
                    results.describe_block_errors
                );
                self.emit(host, LogLevel::Info, &summary, None);
                let (level, verdict) = match results.status {
                    RunStatus::Passed => (LogLevel::Info, "PASS"),
                    RunStatus::Todo => (LogLevel::Warn, "PASS with todo"),
                    RunStatus::Failed | RunStatus::NotCompleted => (LogLevel::Error, "FAIL"),
                };
                self.emit(host, level, &format!("Test run result: {verdict}"), None);
            }
            TestEvent::LoadError => {
                self.emit(host, LogLevel::Error, "Test run aborted: load error", None);
                for error in &cx.results.additional_errors {
                    self.emit(host, LogLevel::Error, error, None);
                }
            }
            TestEvent::Custom { name, .. } => {
                let message = format!("custom event: {name}");
                self.emit(host, LogLevel::Debug, &message, None);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::events::RunResults;
    use crate::host::ManualHost;
    use crate::tree::TestTree;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<(LogLevel, String)>>>);

    impl LogSink for Recorder {
        fn log(&mut self, level: LogLevel, message: &str, _source: Option<&Source>) {
            self.0.borrow_mut().push((level, message.to_string()));
        }
    }

    #[test]
    fn finished_run_reports_verdict_and_prints_to_game() {
        let recorder = Recorder::default();
        let config = Config {
            log_to_tracing: false,
            log_to_game: true,
            ..Config::default()
        };
        let mut listener = LoggingListener::from_config(&config).with_sink(recorder.clone());
        let host = ManualHost::new();
        let tree = TestTree::new(1);
        let mut results = RunResults {
            ran: 1,
            failed: 1,
            status: RunStatus::Failed,
            ..RunResults::default()
        };
        let mut cx = ListenerContext {
            tree: &tree,
            config: &config,
            results: &mut results,
            host: &host,
            is_rerun: false,
        };

        listener.on_event(&TestEvent::TestRunFinished, &mut cx);

        let lines = recorder.0.borrow();
        assert_eq!(
            lines.last(),
            Some(&(LogLevel::Error, "Test run result: FAIL".to_string()))
        );
        assert!(host
            .printed()
            .iter()
            .any(|line| line == "Test run result: FAIL"));
    }
}
