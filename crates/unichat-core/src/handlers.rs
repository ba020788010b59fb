//! Event handler registry with replace semantics.
//!
//! Registering a handler for an event name replaces any previous handler for
//! that name, so re-running setup code (a screen mounting twice, a reconnect)
//! never stacks duplicate handlers.

use std::collections::HashMap;

/// One handler per event name.
#[derive(Debug)]
pub struct HandlerRegistry<H> {
    handlers: HashMap<String, H>,
}

impl<H> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<H> HandlerRegistry<H> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, returning the handler it replaced.
    pub fn on(&mut self, event: impl Into<String>, handler: H) -> Option<H> {
        self.handlers.insert(event.into(), handler)
    }

    /// Remove the handler for `event`.
    pub fn off(&mut self, event: &str) -> Option<H> {
        self.handlers.remove(event)
    }

    /// Handler for `event`, if registered.
    pub fn get_mut(&mut self, event: &str) -> Option<&mut H> {
        self.handlers.get_mut(event)
    }

    /// True if a handler is registered for `event`.
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
