//! Chunked binary transfers between a circuit and its client.
//!
//! Inbound transfers are assembled in pooled buffers that are zeroed when
//! released. Each accepted chunk refreshes the transfer's heartbeat deadline;
//! a transfer that goes quiet for longer than its timeout fails.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Id of one stream transfer, unique within a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a transfer did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A chunk arrived out of order or was repeated.
    #[error("expected chunk {expected}, received chunk {received}")]
    OutOfSequence {
        /// Next chunk id the transfer was waiting for.
        expected: u64,
        /// Chunk id that actually arrived.
        received: u64,
    },
    /// The client reported a failure while reading its data.
    #[error("client aborted the transfer: {0}")]
    Client(String),
    /// More data arrived than announced, or the announced length was too large.
    #[error("stream exceeds its length limit of {limit} bytes")]
    Overflow {
        /// Announced or configured limit.
        limit: u64,
    },
    /// No chunk arrived within the heartbeat timeout.
    #[error("stream transfer timed out")]
    TimedOut,
    /// The owning circuit terminated.
    #[error("circuit is gone")]
    CircuitGone,
}

/// Response to one inbound chunk. Doubles as the transfer heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkAck {
    /// The chunk was appended; more are expected.
    Accepted,
    /// The chunk completed the transfer.
    Completed,
    /// The transfer was aborted by this chunk.
    Aborted(StreamError),
    /// No transfer with this id is in progress.
    Unknown,
}

impl ChunkAck {
    /// Boolean heartbeat sent back to the client.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Accepted | Self::Completed)
    }
}

/// Reusable assembly buffers.
pub struct BufferPool {
    free: Vec<BytesMut>,
    max_pooled: usize,
}

impl BufferPool {
    /// Pool that keeps at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Vec::new(),
            max_pooled,
        }
    }

    /// Take a buffer with at least `capacity` bytes reserved.
    pub fn acquire(&mut self, capacity: usize) -> BytesMut {
        match self.free.pop() {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    /// Zero and clear a buffer, then keep it for reuse if there is room.
    pub fn release(&mut self, mut buf: BytesMut) {
        buf.fill(0);
        buf.clear();
        if self.free.len() < self.max_pooled {
            self.free.push(buf);
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

type Completion = oneshot::Sender<Result<Bytes, StreamError>>;

struct InboundTransfer {
    total_length: u64,
    expected_chunk: u64,
    buffer: BytesMut,
    timeout: Duration,
    deadline: Instant,
    completion: Completion,
}

/// Every transfer belonging to one circuit.
pub struct StreamTransfers {
    next_id: u64,
    chunk_size: usize,
    max_inbound_length: u64,
    inbound: HashMap<StreamId, InboundTransfer>,
    outbound: HashMap<StreamId, Bytes>,
    pool: BufferPool,
}

impl StreamTransfers {
    /// Transfers that split outbound data into `chunk_size` pieces and accept
    /// inbound streams up to `max_inbound_length` bytes.
    pub fn new(chunk_size: usize, max_inbound_length: u64) -> Self {
        Self {
            next_id: 1,
            chunk_size: chunk_size.max(1),
            max_inbound_length,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            pool: BufferPool::new(4),
        }
    }

    fn allocate_id(&mut self) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Open a transfer of `total_length` bytes from the client.
    pub fn open_inbound(
        &mut self,
        total_length: u64,
        timeout: Duration,
    ) -> Result<(StreamId, oneshot::Receiver<Result<Bytes, StreamError>>), StreamError> {
        if total_length > self.max_inbound_length {
            return Err(StreamError::Overflow {
                limit: self.max_inbound_length,
            });
        }
        let id = self.allocate_id();
        let (completion, rx) = oneshot::channel();
        let capacity = usize::try_from(total_length).unwrap_or(usize::MAX).min(64 * 1024);
        let transfer = InboundTransfer {
            total_length,
            expected_chunk: 0,
            buffer: self.pool.acquire(capacity),
            timeout,
            deadline: Instant::now() + timeout,
            completion,
        };
        let _ = self.inbound.insert(id, transfer);
        debug!(stream_id = %id, total_length, "inbound stream opened");
        Ok((id, rx))
    }

    /// Apply one chunk from the client.
    pub fn receive_chunk(
        &mut self,
        id: StreamId,
        chunk_id: u64,
        data: &[u8],
        error: Option<String>,
    ) -> ChunkAck {
        let Some(mut transfer) = self.inbound.remove(&id) else {
            debug!(stream_id = %id, chunk_id, "chunk for unknown stream");
            return ChunkAck::Unknown;
        };

        if let Some(message) = error {
            return self.abort(id, transfer, StreamError::Client(message));
        }
        if chunk_id != transfer.expected_chunk {
            let err = StreamError::OutOfSequence {
                expected: transfer.expected_chunk,
                received: chunk_id,
            };
            return self.abort(id, transfer, err);
        }
        let received = transfer.buffer.len() as u64 + data.len() as u64;
        if received > transfer.total_length {
            let err = StreamError::Overflow {
                limit: transfer.total_length,
            };
            return self.abort(id, transfer, err);
        }

        transfer.buffer.extend_from_slice(data);
        transfer.expected_chunk += 1;
        transfer.deadline = Instant::now() + transfer.timeout;

        if received == transfer.total_length {
            let payload = Bytes::copy_from_slice(&transfer.buffer);
            self.pool.release(transfer.buffer);
            let _ = transfer.completion.send(Ok(payload));
            debug!(stream_id = %id, chunks = chunk_id + 1, "inbound stream completed");
            ChunkAck::Completed
        } else {
            let _ = self.inbound.insert(id, transfer);
            ChunkAck::Accepted
        }
    }

    fn abort(&mut self, id: StreamId, transfer: InboundTransfer, err: StreamError) -> ChunkAck {
        warn!(stream_id = %id, error = %err, "inbound stream aborted");
        self.pool.release(transfer.buffer);
        let _ = transfer.completion.send(Err(err.clone()));
        ChunkAck::Aborted(err)
    }

    /// Fail every inbound transfer whose heartbeat deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<StreamId> = self
            .inbound
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            if let Some(transfer) = self.inbound.remove(id) {
                let _ = self.abort(*id, transfer, StreamError::TimedOut);
            }
        }
        due.len()
    }

    /// Earliest heartbeat deadline among inbound transfers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inbound.values().map(|t| t.deadline).min()
    }

    /// Hold data until the client asks for it.
    pub fn register_outbound(&mut self, data: Bytes) -> StreamId {
        let id = self.allocate_id();
        let _ = self.outbound.insert(id, data);
        id
    }

    /// Remove an outbound stream and split it into chunks.
    pub fn take_outbound(&mut self, id: StreamId) -> Option<Vec<Bytes>> {
        let data = self.outbound.remove(&id)?;
        let mut chunks = Vec::with_capacity(data.len().div_ceil(self.chunk_size));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            chunks.push(data.slice(offset..end));
            offset = end;
        }
        Some(chunks)
    }

    /// Abort everything in flight. Called when the circuit terminates.
    pub fn abort_all(&mut self) {
        let ids: Vec<StreamId> = self.inbound.keys().copied().collect();
        for id in ids {
            if let Some(transfer) = self.inbound.remove(&id) {
                self.pool.release(transfer.buffer);
                let _ = transfer.completion.send(Err(StreamError::CircuitGone));
            }
        }
        self.outbound.clear();
    }

    /// Uploads still being received, oldest first.
    pub fn inbound_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.inbound.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of transfers in progress in either direction.
    pub fn active(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn transfers() -> StreamTransfers {
        StreamTransfers::new(4, 1024)
    }

    #[tokio::test]
    async fn assembles_sequential_chunks() {
        let mut streams = transfers();
        let (id, rx) = streams.open_inbound(6, Duration::from_secs(60)).unwrap();
        assert_eq!(streams.receive_chunk(id, 0, b"abc", None), ChunkAck::Accepted);
        assert_eq!(streams.receive_chunk(id, 1, b"def", None), ChunkAck::Completed);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(streams.active(), 0);
    }

    #[tokio::test]
    async fn skipped_chunk_aborts_after_it_arrives() {
        let mut streams = transfers();
        let (id, rx) = streams.open_inbound(100, Duration::from_secs(60)).unwrap();
        assert!(streams.receive_chunk(id, 0, b"a", None).is_ok());
        assert!(streams.receive_chunk(id, 1, b"b", None).is_ok());

        let ack = streams.receive_chunk(id, 3, b"d", None);
        assert_eq!(
            ack,
            ChunkAck::Aborted(StreamError::OutOfSequence {
                expected: 2,
                received: 3
            })
        );
        assert!(!ack.is_ok());
        assert_matches!(
            rx.await.unwrap(),
            Err(StreamError::OutOfSequence { expected: 2, received: 3 })
        );
        assert_eq!(streams.receive_chunk(id, 2, b"c", None), ChunkAck::Unknown);
    }

    #[tokio::test]
    async fn duplicate_chunk_aborts() {
        let mut streams = transfers();
        let (id, _rx) = streams.open_inbound(10, Duration::from_secs(60)).unwrap();
        assert!(streams.receive_chunk(id, 0, b"a", None).is_ok());
        assert_matches!(
            streams.receive_chunk(id, 0, b"a", None),
            ChunkAck::Aborted(StreamError::OutOfSequence { expected: 1, received: 0 })
        );
    }

    #[tokio::test]
    async fn client_error_and_overflow_abort() {
        let mut streams = transfers();
        let (id, rx) = streams.open_inbound(10, Duration::from_secs(60)).unwrap();
        assert_matches!(
            streams.receive_chunk(id, 0, b"", Some("read failed".into())),
            ChunkAck::Aborted(StreamError::Client(_))
        );
        assert_matches!(rx.await.unwrap(), Err(StreamError::Client(m)) if m == "read failed");

        let (id, _rx) = streams.open_inbound(2, Duration::from_secs(60)).unwrap();
        assert_matches!(
            streams.receive_chunk(id, 0, b"abc", None),
            ChunkAck::Aborted(StreamError::Overflow { limit: 2 })
        );
    }

    #[test]
    fn rejects_oversized_announcement() {
        let mut streams = transfers();
        assert_matches!(
            streams.open_inbound(4096, Duration::from_secs(60)),
            Err(StreamError::Overflow { limit: 1024 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_refresh_heartbeat() {
        let mut streams = transfers();
        let (id, rx) = streams.open_inbound(10, Duration::from_millis(100)).unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(streams.receive_chunk(id, 0, b"a", None).is_ok());
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(streams.expire_due(Instant::now()), 0);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(streams.expire_due(Instant::now()), 1);
        assert_matches!(rx.await.unwrap(), Err(StreamError::TimedOut));
        assert!(streams.next_deadline().is_none());
    }

    #[test]
    fn outbound_is_split_into_chunks() {
        let mut streams = transfers();
        let id = streams.register_outbound(Bytes::from_static(b"0123456789"));
        let chunks = streams.take_outbound(id).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], Bytes::from_static(b"0123"));
        assert_eq!(chunks[2], Bytes::from_static(b"89"));
        assert!(streams.take_outbound(id).is_none());
    }

    #[tokio::test]
    async fn abort_all_fails_inbound() {
        let mut streams = transfers();
        let (id, rx) = streams.open_inbound(10, Duration::from_secs(60)).unwrap();
        let _ = streams.register_outbound(Bytes::from_static(b"x"));
        assert_eq!(streams.inbound_ids(), vec![id]);
        streams.abort_all();
        assert!(streams.inbound_ids().is_empty());
        assert_matches!(rx.await.unwrap(), Err(StreamError::CircuitGone));
        assert_eq!(streams.active(), 0);
    }

    #[test]
    fn pool_zeroes_released_buffers() {
        let mut pool = BufferPool::new(1);
        let mut buf = pool.acquire(8);
        buf.extend_from_slice(b"secret");
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire(8);
        assert!(reused.is_empty());
        pool.release(reused);
        pool.release(BytesMut::with_capacity(8));
        assert_eq!(pool.idle(), 1);
    }
}
