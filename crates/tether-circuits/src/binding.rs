//! Connection-to-circuit handles.
//!
//! A connection stores a [`HandleId`], never a [`Circuit`]. The circuit
//! clears its slot when it terminates, so a connection can tell "my circuit
//! died" apart from "I never started one" without keeping the circuit alive.

use dashmap::DashMap;
use tether_core::HandleId;
use tracing::debug;

use crate::circuit::Circuit;

/// What a connection's handle currently points at.
#[derive(Clone, Debug)]
pub enum Resolution {
    /// The circuit is alive.
    Bound(Circuit),
    /// The connection never completed start or reconnect.
    NotStarted,
    /// The circuit behind the handle has terminated.
    Gone,
}

/// Process-wide table of handles.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: DashMap<HandleId, Option<Circuit>>,
}

impl HandleTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point a handle at a circuit.
    pub fn bind(&self, handle: HandleId, circuit: Circuit) {
        let _ = self.slots.insert(handle, Some(circuit));
    }

    /// Empty a handle's target. Connections holding it will resolve to
    /// [`Resolution::Gone`].
    pub fn clear(&self, handle: &HandleId) {
        if let Some(mut slot) = self.slots.get_mut(handle) {
            *slot = None;
            debug!(handle_id = %handle, "circuit handle cleared");
        }
    }

    /// Drop a cleared slot. Slots that still point at a live circuit are kept.
    pub fn release(&self, handle: &HandleId) -> bool {
        self.slots.remove_if(handle, |_, slot| slot.is_none()).is_some()
    }

    /// Resolve the handle a connection holds, if any.
    pub fn resolve(&self, handle: Option<&HandleId>) -> Resolution {
        let Some(handle) = handle else {
            return Resolution::NotStarted;
        };
        match self.slots.get(handle) {
            Some(slot) => match slot.value() {
                Some(circuit) => Resolution::Bound(circuit.clone()),
                None => Resolution::Gone,
            },
            None => Resolution::Gone,
        }
    }

    /// Number of slots, bound or cleared.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use assert_matches::assert_matches;
    use tether_core::CircuitId;

    #[tokio::test]
    async fn bind_clear_release() {
        let table = HandleTable::new();
        let handle = HandleId::new();
        let (circuit, _inbox) = Circuit::detached(CircuitId::from("c1"), handle.clone());

        assert_matches!(table.resolve(None), Resolution::NotStarted);
        assert_matches!(table.resolve(Some(&handle)), Resolution::Gone);

        table.bind(handle.clone(), circuit);
        assert_matches!(table.resolve(Some(&handle)), Resolution::Bound(c) if c.id().as_str() == "c1");
        assert!(!table.release(&handle), "live slot must not be released");

        table.clear(&handle);
        assert_matches!(table.resolve(Some(&handle)), Resolution::Gone);
        assert!(table.release(&handle));
        assert!(table.is_empty());
        assert_matches!(table.resolve(Some(&handle)), Resolution::Gone);
    }
}
