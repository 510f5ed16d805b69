//! Request correlation table.
//!
//! Maps request identifiers to their pending completion handle and, for
//! streaming requests, to the chunk sink. An entry is removed exactly once,
//! by whichever of resolve, reject, timeout or abort happens first; later
//! attempts find nothing and report `false`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::Error;
use crate::stream::StreamChunk;

/// Completion handle of one request.
pub(crate) type Completion = oneshot::Sender<Result<Value, Error>>;

/// Chunk sink of one streaming request.
pub(crate) type ChunkSink = mpsc::UnboundedSender<StreamChunk>;

/// One outstanding request awaiting a terminal response.
pub(crate) struct PendingRequest {
    seq: u64,
    frame: String,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn settle(self, result: Result<Value, Error>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.completion.send(result);
    }
}

#[derive(Default)]
pub(crate) struct CorrelationTable {
    next_seq: u64,
    pending: HashMap<String, PendingRequest>,
    streams: HashMap<String, ChunkSink>,
}

impl CorrelationTable {
    /// Generates an identifier not currently present in the table.
    pub fn next_request_id(&self) -> String {
        loop {
            let id = generate_request_id();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a request together with the serialized frame kept for replay.
    pub fn register(&mut self, id: String, frame: String, completion: Completion) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            id,
            PendingRequest {
                seq,
                frame,
                completion,
                timer: None,
            },
        );
    }

    /// Registers a streaming request. The chunk sink and the pending entry
    /// share the identifier and are removed together.
    pub fn register_stream(&mut self, id: String, frame: String, completion: Completion, sink: ChunkSink) {
        self.streams.insert(id.clone(), sink);
        self.register(id, frame, completion);
    }

    /// Attaches the timeout task of a pending request. If the request is
    /// already gone the timer is cancelled immediately.
    pub fn set_timer(&mut self, id: &str, timer: AbortHandle) {
        match self.pending.get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub fn is_stream(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Hands a chunk to the stream registered under `id`. Only the stream
    /// map is consulted.
    pub fn deliver_chunk(&self, id: &str, chunk: StreamChunk) -> bool {
        match self.streams.get(id) {
            Some(sink) => {
                // A dropped receiver is cleaned up by the handle's abort.
                let _ = sink.send(chunk);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&mut self, id: &str, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    pub fn reject(&mut self, id: &str, error: Error) -> bool {
        self.settle(id, Err(error))
    }

    /// Removes a request on caller abort.
    pub fn abort(&mut self, id: &str) -> bool {
        self.settle(id, Err(Error::Aborted))
    }

    /// Rejects every pending request with `error`. Returns how many were
    /// rejected.
    pub fn reject_all(&mut self, error: &Error) -> usize {
        self.streams.clear();
        let drained: Vec<PendingRequest> = self.pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.settle(Err(error.clone()));
        }
        count
    }

    /// Frames of all pending requests in registration order.
    pub fn replay_frames(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(&String, &PendingRequest)> = self.pending.iter().collect();
        entries.sort_by_key(|(_, p)| p.seq);
        entries
            .into_iter()
            .map(|(id, p)| (id.clone(), p.frame.clone()))
            .collect()
    }

    fn settle(&mut self, id: &str, result: Result<Value, Error>) -> bool {
        // Dropping the sink closes the chunk channel behind any buffered
        // chunks, so the consumer sees every chunk before the terminal event.
        self.streams.remove(id);
        match self.pending.remove(id) {
            Some(pending) => {
                pending.settle(result);
                true
            }
            None => false,
        }
    }
}

/// Time-based identifier with a random suffix.
pub(crate) fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", millis, &suffix[..9])
}
