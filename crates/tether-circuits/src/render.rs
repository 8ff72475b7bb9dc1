//! Render-batch backpressure.
//!
//! At most `max_unacknowledged` batches may be in flight. Once the window is
//! full the circuit stops asking its renderer for new batches until the
//! client acknowledges the oldest one. Unacknowledged batches are retained so
//! they can be replayed, in order, to a reconnecting client. The window also
//! remembers how many of them actually reached the transport, so a batch
//! that found the outbound queue full is retried rather than lost.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Render batch id, strictly increasing from 1 within a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch sent to the client and not yet acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBatch {
    /// Batch id.
    pub id: BatchId,
    /// Encoded batch as produced by the renderer.
    pub data: Bytes,
}

/// Result of an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The oldest batch was released. `resumed` is set when production had
    /// been paused by a full window.
    Released {
        /// Whether production may resume.
        resumed: bool,
    },
    /// Acknowledgement for a batch that was already released.
    Stale,
    /// Acknowledgement for a batch that was never produced.
    Unknown,
    /// Acknowledgement that skips the oldest outstanding batch.
    OutOfOrder {
        /// Batch the controller expected to be acknowledged next.
        expected: BatchId,
    },
}

/// Bounded window of unacknowledged render batches.
#[derive(Debug)]
pub struct RenderBatchFlowController {
    max_unacknowledged: usize,
    unacknowledged: VecDeque<PendingBatch>,
    /// Leading entries of `unacknowledged` handed to the transport.
    sent: usize,
    last_released: BatchId,
    paused: bool,
}

impl RenderBatchFlowController {
    /// Controller that allows `max_unacknowledged` batches in flight.
    pub fn new(max_unacknowledged: usize) -> Self {
        Self {
            max_unacknowledged: max_unacknowledged.max(1),
            unacknowledged: VecDeque::new(),
            sent: 0,
            last_released: BatchId(0),
            paused: false,
        }
    }

    /// Record a batch as sent. Returns `false` when the window is full; the
    /// caller must pause production.
    pub fn try_enqueue(&mut self, id: BatchId, data: Bytes) -> bool {
        if self.is_full() {
            self.paused = true;
            return false;
        }
        self.unacknowledged.push_back(PendingBatch { id, data });
        true
    }

    /// Apply a client acknowledgement.
    pub fn acknowledge(&mut self, id: BatchId, error: Option<&str>) -> AckOutcome {
        let Some(oldest) = self.unacknowledged.front().map(|b| b.id) else {
            return self.classify_missing(id);
        };

        if id == oldest {
            let _ = self.unacknowledged.pop_front();
            self.sent = self.sent.saturating_sub(1);
            self.last_released = id;
            if let Some(error) = error {
                debug!(batch_id = %id, error, "client reported render batch error");
            }
            let resumed = self.paused && !self.is_full();
            if resumed {
                self.paused = false;
            }
            AckOutcome::Released { resumed }
        } else if id < oldest {
            self.classify_missing(id)
        } else if self.unacknowledged.iter().any(|b| b.id == id) {
            AckOutcome::OutOfOrder { expected: oldest }
        } else {
            AckOutcome::Unknown
        }
    }

    fn classify_missing(&self, id: BatchId) -> AckOutcome {
        if id <= self.last_released && id.0 > 0 {
            AckOutcome::Stale
        } else {
            AckOutcome::Unknown
        }
    }

    /// Unacknowledged batches, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingBatch> {
        self.unacknowledged.iter()
    }

    /// Oldest batch not yet handed to the transport.
    pub fn next_unsent(&self) -> Option<&PendingBatch> {
        self.unacknowledged.get(self.sent)
    }

    /// Record that [`next_unsent`](Self::next_unsent) was handed to the transport.
    pub fn mark_sent(&mut self) {
        self.sent = (self.sent + 1).min(self.unacknowledged.len());
    }

    /// Treat every pending batch as unsent, e.g. for a new connection.
    pub fn mark_all_unsent(&mut self) {
        self.sent = 0;
    }

    /// Whether the window is full.
    pub fn is_full(&self) -> bool {
        self.unacknowledged.len() >= self.max_unacknowledged
    }

    /// Number of batches in flight.
    pub fn len(&self) -> usize {
        self.unacknowledged.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.unacknowledged.is_empty()
    }

    /// Drop every retained batch.
    pub fn clear(&mut self) {
        self.unacknowledged.clear();
        self.sent = 0;
        self.paused = false;
    }
}
