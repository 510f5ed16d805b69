//! Streaming generation handle.

use std::sync::Weak;

use base64::Engine;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::messages::ChunkKind;
use crate::session::Inner;

/// One incremental piece of a streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Which stream produced the chunk.
    pub kind: ChunkKind,
    /// The frame's `data` object, untouched.
    pub data: Value,
}

impl StreamChunk {
    pub fn new(kind: ChunkKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Text carried by the chunk (`chunk` or `text` field).
    pub fn text(&self) -> Option<&str> {
        self.data
            .get("chunk")
            .or_else(|| self.data.get("text"))
            .and_then(Value::as_str)
    }

    /// Decodes base64 audio carried by a TTS chunk (`audio` or `chunk` field).
    pub fn audio(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        let encoded = self
            .data
            .get("audio")
            .or_else(|| self.data.get("chunk"))
            .and_then(Value::as_str)?;
        Some(base64::engine::general_purpose::STANDARD.decode(encoded))
    }
}

/// Events yielded by a [`GenerationStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental data.
    Chunk(StreamChunk),
    /// Terminal success with the generation result.
    Complete(Value),
    /// Terminal failure.
    Error(Error),
}

/// Handle to an in-flight streaming request.
///
/// Yields any number of chunks, then exactly one terminal event, then `None`.
/// Dropping an unfinished handle aborts the request.
pub struct GenerationStream {
    request_id: String,
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    completion: Option<oneshot::Receiver<Result<Value, Error>>>,
    session: Weak<Inner>,
}

impl GenerationStream {
    pub(crate) fn new(
        request_id: String,
        chunks: mpsc::UnboundedReceiver<StreamChunk>,
        completion: oneshot::Receiver<Result<Value, Error>>,
        session: Weak<Inner>,
    ) -> Self {
        Self {
            request_id,
            chunks,
            completion: Some(completion),
            session,
        }
    }

    /// The identifier correlating this stream's frames.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns true once the terminal event has been taken or the stream
    /// was aborted.
    pub fn is_finished(&self) -> bool {
        self.completion.is_none()
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        // The chunk channel closes when the request settles, after every
        // chunk that preceded the terminal frame.
        if let Some(chunk) = self.chunks.recv().await {
            return Some(StreamEvent::Chunk(chunk));
        }
        let completion = self.completion.take()?;
        Some(match completion.await {
            Ok(Ok(result)) => StreamEvent::Complete(result),
            Ok(Err(e)) => StreamEvent::Error(e),
            Err(_) => StreamEvent::Error(Error::Aborted),
        })
    }

    /// Drives the stream to completion, calling `on_chunk` for every chunk
    /// in arrival order. Returns the terminal result.
    pub async fn for_each_chunk<F>(mut self, mut on_chunk: F) -> Result<Value, Error>
    where
        F: FnMut(StreamChunk),
    {
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Chunk(chunk) => on_chunk(chunk),
                StreamEvent::Complete(result) => return Ok(result),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(Error::Aborted)
    }

    /// Cancels the request. Buffered chunks are discarded and no further
    /// events are yielded. Calling this after the stream finished does
    /// nothing.
    pub fn abort(&mut self) {
        if self.completion.take().is_none() {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            inner.abort_request(&self.request_id);
        }
        self.chunks.close();
        while self.chunks.try_recv().is_ok() {}
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("request_id", &self.request_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
