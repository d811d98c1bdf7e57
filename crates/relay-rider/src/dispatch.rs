use relay_core::protocol::{FrameKind, RawFrame};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

pub type Handler = Box<dyn Fn(Value) + Send + Sync>;

/// Single dispatch table keyed by frame type. All inbound socket traffic
/// funnels through here; an unrecognized type is logged and dropped, never
/// fatal.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<FrameKind, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, kind: FrameKind, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    pub fn dispatch(&self, text: &str) {
        let raw: RawFrame = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", error = %err);
                return;
            }
        };
        let kind: FrameKind = match raw.kind.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(event = "frame_unrecognized", r#type = %raw.kind);
                return;
            }
        };
        match self.handlers.get(&kind) {
            Some(handler) => handler(raw.payload),
            None => warn!(event = "frame_unhandled", r#type = kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn known_frames_reach_their_handler_with_the_payload() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let dispatcher = Dispatcher::new().on(FrameKind::NewMessage, move |payload| {
            assert_eq!(payload["message"]["id"], 3);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(r#"{"type":"NEW_MESSAGE","payload":{"message":{"id":3}}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_types_are_dropped_without_panicking() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(r#"{"type":"SHINY_NEW_THING","payload":{}}"#);
        dispatcher.dispatch("not even json");
        dispatcher.dispatch(r#"{"type":"RIDER_MOVED","payload":{}}"#);
    }
}
