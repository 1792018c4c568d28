//! Handler contract and the closure adapter.

use crate::event::{Event, EventKind};

/// A callable registered for one or more event kinds.
///
/// `handle` returns `false` to report failure; dispatch continues to the
/// remaining handlers either way. Handlers run on the flow's worker thread
/// and must not block for long.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> bool;

    fn name(&self) -> &str;

    fn supported_kinds(&self) -> Vec<EventKind>;
}

/// Closure-backed handler.
pub struct FnHandler {
    name: String,
    kinds: Vec<EventKind>,
    f: Box<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl FnHandler {
    pub fn new(
        name: impl Into<String>,
        kinds: Vec<EventKind>,
        f: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> FnHandler {
        FnHandler {
            name: name.into(),
            kinds,
            f: Box::new(f),
        }
    }
}

impl EventHandler for FnHandler {
    fn handle(&self, event: &Event) -> bool {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supported_kinds(&self) -> Vec<EventKind> {
        self.kinds.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_handler() {
        let h = FnHandler::new("probe", vec![EventKind::Custom], |ev| ev.priority > 0);
        assert_eq!(h.name(), "probe");
        assert_eq!(h.supported_kinds(), vec![EventKind::Custom]);

        let low = Event::new(EventKind::Custom, "", "");
        assert!(!h.handle(&low));
        assert!(h.handle(&low.clone().with_priority(1)));
    }
}
