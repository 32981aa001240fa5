//! Typed in-process message bus.
//!
//! Handlers register per message kind and run synchronously, in
//! registration order, in the dispatching task. A handler receives a
//! borrow of the shared context (the peer state) and the message; any
//! messages it wants to emit go through the context's outbox and are
//! processed after the current dispatch returns, never re-entrantly.

use std::collections::HashMap;

use tracing::warn;

use crate::messages::Message;

type Handler<C> = Box<dyn FnMut(&mut C, &Message) + Send>;

pub struct Emitter<C> {
    handlers: HashMap<String, Vec<Handler<C>>>,
}

impl<C> Default for Emitter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Emitter<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a message kind. Multiple handlers per
    /// kind run in registration order.
    pub fn on(&mut self, kind: &str, handler: impl FnMut(&mut C, &Message) + Send + 'static) {
        self.handlers
            .entry(kind.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Invoke every handler registered for the message's kind.
    /// Returns false when no handler exists; the message is dropped
    /// with a warning, not an error.
    pub fn dispatch(&mut self, ctx: &mut C, message: &Message) -> bool {
        match self.handlers.get_mut(&message.kind) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(ctx, message);
                }
                true
            }
            None => {
                warn!(kind = %message.kind, from = %message.from, "no handler for message kind, dropping");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, DEFAULT_TTL};
    use serde_json::Value;

    #[derive(Default)]
    struct Ctx {
        calls: Vec<&'static str>,
    }

    fn msg(kind: &str) -> Message {
        Message::new(kind, "a", "b", DEFAULT_TTL, Value::Null)
    }

    #[test]
    fn dispatch_runs_handlers_in_registration_order() {
        let mut emitter: Emitter<Ctx> = Emitter::new();
        emitter.on("ping", |ctx, _| ctx.calls.push("first"));
        emitter.on("ping", |ctx, _| ctx.calls.push("second"));

        let mut ctx = Ctx::default();
        assert!(emitter.dispatch(&mut ctx, &msg("ping")));
        assert_eq!(ctx.calls, vec!["first", "second"]);
    }

    #[test]
    fn unknown_kind_is_dropped_not_fatal() {
        let mut emitter: Emitter<Ctx> = Emitter::new();
        let mut ctx = Ctx::default();
        assert!(!emitter.dispatch(&mut ctx, &msg("nope")));
        assert!(ctx.calls.is_empty());
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let mut emitter: Emitter<Ctx> = Emitter::new();
        emitter.on("a", |ctx, _| ctx.calls.push("a"));
        emitter.on("b", |ctx, _| ctx.calls.push("b"));

        let mut ctx = Ctx::default();
        emitter.dispatch(&mut ctx, &msg("b"));
        assert_eq!(ctx.calls, vec!["b"]);
    }
}
