use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostEvent {
    Tick,
    GameCreated,
}

pub type EventHandler = Rc<dyn Fn(HostEvent)>;

/// The host's own event-subscription API: one handler slot per event.
pub trait EventRegistry {
    fn handler(&self, event: HostEvent) -> Option<EventHandler>;
    fn set_handler(&self, event: HostEvent, handler: Option<EventHandler>);
}

/// In-process registry used by hosts without one of their own. Clones share
/// the same slots.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Rc<RefCell<BTreeMap<HostEvent, EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, event: HostEvent) {
        let handler = self.handlers.borrow().get(&event).cloned();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

impl EventRegistry for EventBus {
    fn handler(&self, event: HostEvent) -> Option<EventHandler> {
        self.handlers.borrow().get(&event).cloned()
    }

    fn set_handler(&self, event: HostEvent, handler: Option<EventHandler>) {
        let mut handlers = self.handlers.borrow_mut();
        match handler {
            Some(handler) => {
                handlers.insert(event, handler);
            }
            None => {
                handlers.remove(&event);
            }
        }
    }
}

struct TapSlot {
    original: Option<EventHandler>,
    framework: EventHandler,
}

struct TapInner {
    registry: Rc<dyn EventRegistry>,
    slots: RefCell<BTreeMap<HostEvent, TapSlot>>,
}

impl TapInner {
    fn tap(self: &Rc<Self>, event: HostEvent, framework: EventHandler) {
        let mut slots = self.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(&event) {
            slot.framework = framework;
            return;
        }
        let original = self.registry.handler(event);
        slots.insert(
            event,
            TapSlot {
                original,
                framework,
            },
        );
        drop(slots);

        let weak = Rc::downgrade(self);
        let chained: EventHandler = Rc::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (original, framework) = {
                let slots = inner.slots.borrow();
                match slots.get(&event) {
                    Some(slot) => (slot.original.clone(), Some(Rc::clone(&slot.framework))),
                    None => (None, None),
                }
            };
            if let Some(original) = original {
                original(event);
            }
            if let Some(framework) = framework {
                framework(event);
            }
        });
        self.registry.set_handler(event, Some(chained));
        debug!(?event, "host_event_tapped");
    }

    fn on_event(&self, event: HostEvent, handler: Option<EventHandler>) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(&event) {
            slot.original = handler;
            return;
        }
        self.registry.set_handler(event, handler);
    }

    fn revert(&self) {
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        for (event, slot) in slots {
            self.registry.set_handler(event, slot.original);
            debug!(?event, "host_event_reverted");
        }
    }
}

/// Chains framework handlers after the host's own handlers without
/// displacing them.
///
/// While an event is tapped, host code registers through [`EventTap::on_event`]
/// and its handler keeps running first. Dropping the tap restores every
/// original handler.
pub struct EventTap {
    inner: Rc<TapInner>,
}

impl EventTap {
    pub fn new(registry: Rc<dyn EventRegistry>) -> Self {
        Self {
            inner: Rc::new(TapInner {
                registry,
                slots: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Runs `framework` after the host's handler for `event`. Tapping an event
    /// again replaces the framework handler only.
    pub fn tap(&self, event: HostEvent, framework: EventHandler) {
        self.inner.tap(event, framework);
    }

    /// Host-side registration. Replaces the original slot of a tapped event,
    /// otherwise passes straight through to the registry.
    pub fn on_event(&self, event: HostEvent, handler: Option<EventHandler>) {
        self.inner.on_event(event, handler);
    }

    pub fn revert(&self) {
        self.inner.revert();
    }

    pub fn is_tapped(&self, event: HostEvent) -> bool {
        self.inner.slots.borrow().contains_key(&event)
    }

    pub fn handle(&self) -> TapHandle {
        TapHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl Drop for EventTap {
    fn drop(&mut self) {
        self.inner.revert();
    }
}

/// Non-owning handle used by framework handlers to re-tap or revert.
#[derive(Clone)]
pub struct TapHandle {
    inner: Weak<TapInner>,
}

impl TapHandle {
    pub fn tap(&self, event: HostEvent, framework: EventHandler) {
        if let Some(inner) = self.inner.upgrade() {
            inner.tap(event, framework);
        }
    }

    pub fn revert(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.revert();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, label: &'static str) -> EventHandler {
        let log = Rc::clone(log);
        Rc::new(move |event| log.borrow_mut().push(format!("{label}:{event:?}")))
    }

    #[test]
    fn tapped_handler_runs_after_original_and_revert_restores_it() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bus = EventBus::new();
        bus.set_handler(HostEvent::Tick, Some(recorder(&log, "host")));

        let tap = EventTap::new(Rc::new(bus.clone()));
        tap.tap(HostEvent::Tick, recorder(&log, "framework"));
        bus.raise(HostEvent::Tick);
        tap.revert();
        bus.raise(HostEvent::Tick);

        assert_eq!(
            *log.borrow(),
            vec!["host:Tick", "framework:Tick", "host:Tick"]
        );
        assert!(!tap.is_tapped(HostEvent::Tick));
    }

    #[test]
    fn host_reregistration_replaces_original_slot() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bus = EventBus::new();
        bus.set_handler(HostEvent::Tick, Some(recorder(&log, "old")));

        let tap = EventTap::new(Rc::new(bus.clone()));
        tap.tap(HostEvent::Tick, recorder(&log, "framework"));
        tap.on_event(HostEvent::Tick, Some(recorder(&log, "new")));
        bus.raise(HostEvent::Tick);
        drop(tap);
        bus.raise(HostEvent::Tick);

        assert_eq!(
            *log.borrow(),
            vec!["new:Tick", "framework:Tick", "new:Tick"]
        );
    }

    #[test]
    fn framework_handler_can_revert_from_inside_dispatch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bus = EventBus::new();
        let tap = EventTap::new(Rc::new(bus.clone()));
        let handle = tap.handle();
        let inner_log = Rc::clone(&log);
        tap.tap(
            HostEvent::GameCreated,
            Rc::new(move |_| {
                inner_log.borrow_mut().push("once".to_string());
                handle.revert();
            }),
        );

        bus.raise(HostEvent::GameCreated);
        bus.raise(HostEvent::GameCreated);

        assert_eq!(*log.borrow(), vec!["once"]);
        assert!(bus.handler(HostEvent::GameCreated).is_none());
    }
}
