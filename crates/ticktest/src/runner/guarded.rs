use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use crate::failure::TestFailure;

static INSTALL_HOOK: Once = Once::new();

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CAPTURE_TRACE: Cell<bool> = const { Cell::new(false) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Runs user code behind a catch boundary. Returned failures and panics both
/// come back as the recorded message; with `capture_trace` a panic message is
/// followed by the frames between the panic and this boundary.
pub(crate) fn call<R>(
    capture_trace: bool,
    func: impl FnOnce() -> Result<R, TestFailure>,
) -> Result<R, String> {
    install_hook();
    let _depth = DepthGuard::enter(capture_trace);
    match panic::catch_unwind(AssertUnwindSafe(|| user_code_boundary(func))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(failure.into_message()),
        Err(payload) => {
            let message = payload_message(payload.as_ref());
            let trace = LAST_TRACE.with(|slot| slot.borrow_mut().take());
            Err(match trace {
                Some(trace) if !trace.is_empty() => format!("{message}\n{trace}"),
                _ => message,
            })
        }
    }
}

/// Catch boundary for framework-side callbacks such as listeners. The panic is
/// not printed and no trace is kept.
pub(crate) fn call_quiet<R>(func: impl FnOnce() -> R) -> Result<R, String> {
    install_hook();
    let _depth = DepthGuard::enter(false);
    panic::catch_unwind(AssertUnwindSafe(func)).map_err(|payload| payload_message(payload.as_ref()))
}

#[inline(never)]
fn user_code_boundary<R>(func: impl FnOnce() -> R) -> R {
    let result = func();
    let _ = std::hint::black_box(&result);
    result
}

struct DepthGuard {
    previous_capture: bool,
}

impl DepthGuard {
    fn enter(capture_trace: bool) -> Self {
        GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        let previous_capture = CAPTURE_TRACE.with(|flag| flag.replace(capture_trace));
        Self { previous_capture }
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CAPTURE_TRACE.with(|flag| flag.set(self.previous_capture));
        GUARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Panics inside a boundary are silent; everything else goes to the hook that
/// was installed before ours.
fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            if CAPTURE_TRACE.with(Cell::get) {
                let trace = trim_trace(&Backtrace::force_capture().to_string());
                LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
        }));
    });
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

const RUNTIME_FRAME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "rust_begin_unwind",
    "__rust",
    "<alloc::boxed::Box",
    "ticktest::runner::guarded::install_hook",
];

/// Scheduler and registrar frames that call into user code. Test modules
/// inside this crate are user code.
const FRAMEWORK_FRAME_PREFIXES: &[&str] = &[
    "ticktest::runner::",
    "ticktest::setup::",
    "ticktest::harness::",
];

struct Frame<'a> {
    symbol: &'a str,
    lines: Vec<&'a str>,
}

fn is_runtime_frame(symbol: &str) -> bool {
    RUNTIME_FRAME_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
}

fn is_framework_frame(symbol: &str) -> bool {
    if symbol.contains("user_code_boundary") {
        return true;
    }
    let symbol = symbol.trim_start_matches('<');
    FRAMEWORK_FRAME_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
        && !symbol.contains("::tests::")
}

/// Keeps the frames from the first one past the panic machinery up to the
/// first framework frame, renumbered from zero.
fn trim_trace(trace: &str) -> String {
    let mut frames: Vec<Frame<'_>> = Vec::new();
    for line in trace.lines() {
        match frame_header(line) {
            Some(symbol) => frames.push(Frame {
                symbol,
                lines: Vec::new(),
            }),
            None => {
                if let Some(frame) = frames.last_mut() {
                    frame.lines.push(line.trim());
                }
            }
        }
    }

    let start = frames
        .iter()
        .position(|frame| !is_runtime_frame(frame.symbol))
        .unwrap_or(frames.len());
    let mut end = frames[start..]
        .iter()
        .position(|frame| is_framework_frame(frame.symbol))
        .map_or(frames.len(), |offset| start + offset);
    while end > start && is_runtime_frame(frames[end - 1].symbol) {
        end -= 1;
    }

    let mut output = String::from("stack traceback:");
    for (number, frame) in frames[start..end].iter().enumerate() {
        output.push_str(&format!("\n  {number}: {}", frame.symbol));
        for line in &frame.lines {
            output.push_str(&format!("\n        {line}"));
        }
    }
    output
}

fn frame_header(line: &str) -> Option<&str> {
    let (number, symbol) = line.trim_start().split_once(": ")?;
    if number.is_empty() || !number.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some(symbol.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_failure_keeps_its_message() {
        let outcome: Result<(), String> = call(false, || Err(TestFailure::new("boom")));
        assert_eq!(outcome.expect_err("failure"), "boom");
    }

    #[test]
    fn panics_are_caught_with_their_message() {
        let outcome: Result<(), String> = call(false, || panic!("exploded at {}", 3));
        assert_eq!(outcome.expect_err("panic"), "exploded at 3");

        let quiet = call_quiet(|| -> u32 { panic!("listener broke") });
        assert_eq!(quiet.expect_err("panic"), "listener broke");
        assert_eq!(call_quiet(|| 7).expect("value"), 7);
    }

    #[test]
    fn captured_trace_follows_the_message() {
        let outcome: Result<(), String> = call(true, || panic!("with trace"));
        let message = outcome.expect_err("panic");
        assert!(message.starts_with("with trace\nstack traceback:"));
    }

    #[test]
    fn trim_keeps_only_user_frames() {
        let raw = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:310:9
   1: ticktest::runner::guarded::install_hook::{{closure}}
   2: std::panicking::rust_panic_with_hook
   3: suite::helper
             at ./tests/suite.rs:10:5
   4: suite::body::{{closure}}
             at ./tests/suite.rs:4:9
   5: ticktest::runner::guarded::user_code_boundary
   6: ticktest::runner::TestRunner::tick";
        assert_eq!(
            trim_trace(raw),
            "stack traceback:\n  0: suite::helper\n        at ./tests/suite.rs:10:5\n  1: suite::body::{{closure}}\n        at ./tests/suite.rs:4:9"
        );
    }

    #[test]
    fn trim_stops_at_scheduler_frames_and_keeps_iterator_closures() {
        let raw = "   0: std::backtrace::Backtrace::force_capture
   1: ticktest::runner::guarded::install_hook::{{closure}}
   2: core::panicking::panic_fmt
   3: suite::check::{{closure}}
             at ./tests/suite.rs:12:20
   4: core::iter::adapters::map::map_fold::{{closure}}
   5: core::iter::traits::iterator::Iterator::fold
   6: suite::check
             at ./tests/suite.rs:12:5
   7: suite::body::{{closure}}
   8: core::ops::function::Fn::call
   9: ticktest::setup::registrar::part_fn::{{closure}}
  10: ticktest::runner::TestRunner::run_test_part::{{closure}}
  11: ticktest::runner::guarded::user_code_boundary";
        assert_eq!(
            trim_trace(raw),
            "stack traceback:\n  0: suite::check::{{closure}}\n        at ./tests/suite.rs:12:20\n  1: core::iter::adapters::map::map_fold::{{closure}}\n  2: core::iter::traits::iterator::Iterator::fold\n  3: suite::check\n        at ./tests/suite.rs:12:5\n  4: suite::body::{{closure}}"
        );
    }

    #[test]
    fn crate_test_modules_count_as_user_code() {
        assert!(!is_framework_frame("ticktest::runner::tests::jams::{{closure}}"));
        assert!(is_framework_frame(
            "<ticktest::runner::TestRunner>::run_test_part"
        ));
        assert!(!is_framework_frame("suite::helper<ticktest::runner::TestContext>"));
    }
}
