//! Correlation of in-flight interop calls.
//!
//! The table is owned by a circuit's actor and is only ever touched from that
//! task, so it needs no locking. Deadlines are checked by the actor loop via
//! [`PendingCallTable::next_deadline`] and [`PendingCallTable::expire_due`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Correlation id of one interop call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side is expected to answer a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallDirection {
    /// Server invoked client code and awaits its reply.
    ServerToClient,
    /// Client invoked server code whose result is still being computed.
    ClientToServer,
}

/// Final result of an interop call. Payloads are JSON text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call completed and produced a result.
    Succeeded(String),
    /// The call completed with an error.
    Failed(String),
    /// No result arrived before the deadline.
    TimedOut,
    /// The owning circuit terminated first.
    CircuitGone,
}

impl CallOutcome {
    /// Whether the call produced a result.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Payload for the wire: the result or a description of the failure.
    pub fn payload(&self) -> &str {
        match self {
            Self::Succeeded(s) | Self::Failed(s) => s,
            Self::TimedOut => "interop call timed out",
            Self::CircuitGone => "circuit is gone",
        }
    }
}

struct PendingCall {
    direction: CallDirection,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

/// Outstanding calls keyed by correlation id.
pub struct PendingCallTable {
    next_id: u64,
    default_timeout: Duration,
    calls: HashMap<CallId, PendingCall>,
}

impl PendingCallTable {
    /// Empty table whose calls time out after `default_timeout` unless told otherwise.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            default_timeout,
            calls: HashMap::new(),
        }
    }

    /// Allocate a call id and a slot that receives the outcome exactly once.
    pub fn begin_call(
        &mut self,
        direction: CallDirection,
        timeout: Option<Duration>,
    ) -> (CallId, oneshot::Receiver<CallOutcome>) {
        let id = CallId(self.next_id);
        self.next_id += 1;
        let (slot, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let _ = self.calls.insert(
            id,
            PendingCall {
                direction,
                deadline,
                slot,
            },
        );
        (id, rx)
    }

    /// Resolve a call made in `direction`. Returns `false` (and does
    /// nothing) when the id is unknown, already resolved, or belongs to a
    /// call in the other direction.
    pub fn resolve(&mut self, direction: CallDirection, id: CallId, outcome: CallOutcome) -> bool {
        match self.calls.get(&id) {
            Some(call) if call.direction == direction => {}
            _ => {
                debug!(call_id = %id, ?direction, "ignoring result for unknown or settled interop call");
                return false;
            }
        }
        match self.calls.remove(&id) {
            Some(call) => {
                let _ = call.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Time out every call whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            if let Some(call) = self.calls.remove(id) {
                debug!(call_id = %id, direction = ?call.direction, "interop call timed out");
                let _ = call.slot.send(CallOutcome::TimedOut);
            }
        }
        due.len()
    }

    /// Earliest deadline among outstanding calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|call| call.deadline).min()
    }

    /// Resolve every outstanding call with [`CallOutcome::CircuitGone`].
    pub fn fail_all(&mut self) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.slot.send(CallOutcome::CircuitGone);
        }
        count
    }

    /// Outstanding calls made in `direction`, oldest first.
    pub fn outstanding(&self, direction: CallDirection) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.direction == direction)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether the given call is still outstanding.
    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
