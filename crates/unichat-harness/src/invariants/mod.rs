//! Invariant checking for session tests.
//!
//! Invariants are properties of a room's message list that must hold after
//! every step, whatever the interleaving of sends, echoes, history loads and
//! reconnects. Tests take a [`SessionView`] and run an [`InvariantRegistry`]
//! against it.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let view = SessionView::capture(&handle, &[5]).await?;
//! registry.assert_all(&view, "after reconnect");
//! ```

mod checks;
mod view;

pub use checks::{ConfirmedCarryServerId, NewestFirst, UniqueLocalIds, UniqueServerIds};
pub use view::{RoomView, SessionView};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a [`SessionView`].
pub trait Invariant: Send + Sync {
    /// Name used in violations.
    fn name(&self) -> &'static str;

    /// Check the property.
    fn check(&self, view: &SessionView) -> InvariantResult;
}

/// Set of invariants run together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every message list invariant:
    ///
    /// - [`UniqueServerIds`]: no server id appears twice
    /// - [`UniqueLocalIds`]: no local id appears twice
    /// - [`NewestFirst`]: entries sorted by `sent_at` descending
    /// - [`ConfirmedCarryServerId`]: Confirmed entries, and only those, have
    ///   a server id
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(UniqueServerIds);
        registry.add(UniqueLocalIds);
        registry.add(NewestFirst);
        registry.add(ConfirmedCarryServerId);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every invariant, collecting all violations.
    pub fn check_all(&self, view: &SessionView) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> = self.invariants.iter().filter_map(|inv| inv.check(view).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every invariant, panicking with all violations.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, view: &SessionView, context: &str) {
        if let Err(violations) = self.check_all(view) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_every_list_invariant() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 4);
        assert!(registry.check_all(&SessionView::default()).is_ok());
    }
}
