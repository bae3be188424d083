use tracing::warn;

use super::event::TestEvent;
use super::results::RunResults;
use crate::config::Config;
use crate::host::Host;
use crate::runner::guarded;
use crate::tree::TestTree;

/// Everything a listener may look at while handling an event.
pub struct ListenerContext<'a> {
    pub tree: &'a TestTree,
    pub config: &'a Config,
    pub results: &'a mut RunResults,
    pub host: &'a dyn Host,
    pub is_rerun: bool,
}

pub trait TestListener {
    fn on_event(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>);
}

impl<F> TestListener for F
where
    F: FnMut(&TestEvent, &mut ListenerContext<'_>),
{
    fn on_event(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>) {
        self(event, cx)
    }
}

/// Ordered list of listeners. Each listener runs behind its own catch
/// boundary; a panicking listener is logged and the rest still run.
#[derive(Default)]
pub struct EventPipeline {
    listeners: Vec<Box<dyn TestListener>>,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listener: impl TestListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn push_fn<F>(&mut self, func: F)
    where
        F: FnMut(&TestEvent, &mut ListenerContext<'_>) + 'static,
    {
        self.listeners.push(Box::new(func));
    }

    pub fn push_boxed(&mut self, listener: Box<dyn TestListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn raise(&mut self, event: &TestEvent, cx: &mut ListenerContext<'_>) {
        for (index, listener) in self.listeners.iter_mut().enumerate() {
            let outcome = guarded::call_quiet(|| listener.on_event(event, cx));
            if let Err(message) = outcome {
                warn!(
                    listener = index,
                    event = event.name(),
                    error = %message,
                    "test_listener_panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::host::ManualHost;

    #[test]
    fn panicking_listener_does_not_stop_later_listeners() {
        let seen = Rc::new(RefCell::new(Vec::<&'static str>::new()));
        let mut pipeline = EventPipeline::new();
        pipeline.push_fn(|_, _| panic!("gui exploded"));
        let sink = Rc::clone(&seen);
        pipeline.push_fn(move |event, _| sink.borrow_mut().push(event.name()));

        let tree = TestTree::new(1);
        let config = Config::default();
        let mut results = RunResults::default();
        let host = ManualHost::new();
        let mut cx = ListenerContext {
            tree: &tree,
            config: &config,
            results: &mut results,
            host: &host,
            is_rerun: false,
        };
        pipeline.raise(&TestEvent::TestRunStarted, &mut cx);
        pipeline.raise(&TestEvent::TestRunFinished, &mut cx);

        assert_eq!(*seen.borrow(), vec!["testRunStarted", "testRunFinished"]);
    }
}
