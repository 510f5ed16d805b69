//! Session: one logical, authenticated connection to the generation service.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::correlation::{ChunkSink, CorrelationTable};
use crate::driver;
use crate::error::Error;
use crate::messages::{ClientFrame, RequestKind};
use crate::requests::{ImageRequest, LlmRequest, SttRequest, TtsRequest, UpscaleRequest, VideoRequest};
use crate::stream::GenerationStream;
use crate::ws::Outbound;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

type ConnectWaiter = oneshot::Sender<Result<(), Error>>;

struct Lifecycle {
    state: ConnectionState,
    waiters: Vec<ConnectWaiter>,
}

pub(crate) enum ConnectTicket {
    Ready,
    Spawn(oneshot::Receiver<Result<(), Error>>),
    Wait(oneshot::Receiver<Result<(), Error>>),
}

/// State shared by the public handle, the driver task and the timers.
pub(crate) struct Inner {
    pub(crate) config: SessionConfig,
    pub(crate) session_id: String,
    pub(crate) table: Mutex<CorrelationTable>,
    pub(crate) reconnect_attempts: AtomicU32,
    pub(crate) shutdown: Notify,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Outbound>>,
    authenticated: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            session_id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            table: Mutex::new(CorrelationTable::default()),
            reconnect_attempts: AtomicU32::new(0),
            shutdown: Notify::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                waiters: Vec::new(),
            }),
            state_tx,
            transport: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
            && self.state() == ConnectionState::Ready
            && self
                .transport
                .lock()
                .as_ref()
                .map_or(false, |t| t.is_open())
    }

    /// Decides what a `connect()` call does. The state check and waiter
    /// registration happen under one lock so no outcome is missed.
    pub(crate) fn begin_connect(&self) -> Result<ConnectTicket, Error> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Ready => Ok(ConnectTicket::Ready),
            ConnectionState::Disconnected => {
                let (tx, rx) = oneshot::channel();
                lifecycle.waiters.push(tx);
                lifecycle.state = ConnectionState::Connecting;
                self.state_tx.send_replace(ConnectionState::Connecting);
                Ok(ConnectTicket::Spawn(rx))
            }
            _ => {
                let (tx, rx) = oneshot::channel();
                lifecycle.waiters.push(tx);
                Ok(ConnectTicket::Wait(rx))
            }
        }
    }

    /// Moves the state machine. Once closed, only `Disconnected` is accepted.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut lifecycle = self.lifecycle.lock();
        if self.is_closed() && state != ConnectionState::Disconnected {
            return;
        }
        if lifecycle.state != state {
            debug!(session_id = %self.session_id, from = %lifecycle.state, to = %state, "State change");
            lifecycle.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Marks the session ready and releases every `connect()` waiter.
    fn set_ready(&self) {
        let waiters = {
            let mut lifecycle = self.lifecycle.lock();
            if self.is_closed() {
                return;
            }
            lifecycle.state = ConnectionState::Ready;
            self.state_tx.send_replace(ConnectionState::Ready);
            std::mem::take(&mut lifecycle.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Settles the session in `Disconnected`, failing any remaining
    /// `connect()` waiters with `error`.
    pub(crate) fn finish(&self, error: Error) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.clear_transport();
        let waiters = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ConnectionState::Disconnected;
            self.state_tx.send_replace(ConnectionState::Disconnected);
            std::mem::take(&mut lifecycle.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Publishes a freshly opened socket. Refused once the session is closed.
    pub(crate) fn install_transport(&self, outbound: Outbound) -> bool {
        let mut slot = self.transport.lock();
        if self.is_closed() {
            return false;
        }
        *slot = Some(outbound);
        true
    }

    pub(crate) fn clear_transport(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.transport.lock().take();
    }

    fn transmit(&self, text: String) -> Result<(), Error> {
        match self.transport.lock().as_ref() {
            Some(outbound) => outbound.send_text(text),
            None => Err(Error::NotConnected),
        }
    }

    /// Completes the handshake: replays pending requests on the new socket,
    /// then opens the session to callers.
    pub(crate) fn on_authenticated(&self, outbound: &Outbound) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let table = self.table.lock();
        let frames = table.replay_frames();
        if !frames.is_empty() {
            info!(session_id = %self.session_id, count = frames.len(), "Replaying pending requests");
        }
        for (id, frame) in frames {
            debug!(request_id = %id, "Replaying request");
            if let Err(e) = outbound.send_text(frame) {
                warn!(request_id = %id, error = %e, "Replay failed");
                break;
            }
        }
        self.authenticated.store(true, Ordering::SeqCst);
        self.set_ready();
        info!(session_id = %self.session_id, "Session ready");
    }

    /// Registers and transmits a request. The frame is sent while the table
    /// is locked, so a concurrent replay can never duplicate it.
    fn submit(
        self: &Arc<Self>,
        kind: RequestKind,
        data: Value,
        timeout: Option<Duration>,
        sink: Option<ChunkSink>,
    ) -> Result<(String, oneshot::Receiver<Result<Value, Error>>), Error> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let mut table = self.table.lock();
        // Checked under the table lock: close() marks the session closed
        // before it drains the table.
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        let id = table.next_request_id();
        let text = ClientFrame::request(kind, data, &id).to_text()?;
        match sink {
            Some(sink) => table.register_stream(id.clone(), text.clone(), tx, sink),
            None => table.register(id.clone(), text.clone(), tx),
        }
        let timer = self.arm_timeout(id.clone(), timeout);
        table.set_timer(&id, timer);

        debug!(request_id = %id, kind = %kind, "Sending request");
        if let Err(e) = self.transmit(text) {
            debug!(request_id = %id, error = %e, "Transmit failed, request kept for replay");
        }
        Ok((id, rx))
    }

    fn arm_timeout(self: &Arc<Self>, id: String, after: Duration) -> AbortHandle {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id, after);
            }
        })
        .abort_handle()
    }

    fn expire(&self, id: &str, after: Duration) {
        let was_stream = {
            let mut table = self.table.lock();
            let was_stream = table.is_stream(id);
            if !table.reject(id, Error::RequestTimeout(after)) {
                return;
            }
            was_stream
        };
        warn!(session_id = %self.session_id, request_id = %id, timeout_ms = after.as_millis() as u64, "Request timed out");
        if was_stream {
            self.send_cancel(id);
        }
    }

    /// Removes a request and tells the server to stop working on it.
    pub(crate) fn abort_request(&self, id: &str) -> bool {
        if !self.table.lock().abort(id) {
            return false;
        }
        debug!(request_id = %id, "Request aborted");
        self.send_cancel(id);
        true
    }

    fn send_cancel(&self, id: &str) {
        if !self.is_connected() {
            return;
        }
        match ClientFrame::cancel(id).to_text() {
            Ok(text) => {
                let _ = self.transmit(text);
            }
            Err(e) => warn!(request_id = %id, error = %e, "Failed to encode cancel frame"),
        }
    }

    /// Rejects everything pending, disables reconnection and closes the socket.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, "Session closing");
        let rejected = self.table.lock().reject_all(&Error::ClientClosed);
        if rejected > 0 {
            debug!(session_id = %self.session_id, rejected = rejected, "Rejected pending requests");
        }
        self.authenticated.store(false, Ordering::SeqCst);
        if let Some(outbound) = self.transport.lock().take() {
            outbound.close(CloseCode::Normal, "client closed");
        }
        self.shutdown.notify_one();
        self.finish(Error::ClientClosed);
    }
}

struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A client session multiplexing requests over one WebSocket.
///
/// Cheap to clone; all clones share the same connection. Dropping the last
/// clone closes the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
    _guard: Arc<CloseOnDrop>,
}

impl Session {
    /// Creates a disconnected session.
    pub fn new(config: SessionConfig) -> Self {
        let inner = Arc::new(Inner::new(config));
        Self {
            _guard: Arc::new(CloseOnDrop(Arc::clone(&inner))),
            inner,
        }
    }

    /// Short identifier used in this session's logs.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Connects and authenticates.
    ///
    /// Returns immediately when already ready. While a connection attempt is
    /// in flight, further calls wait on that attempt instead of opening
    /// another socket.
    pub async fn connect(&self) -> Result<(), Error> {
        let rx = match self.inner.begin_connect()? {
            ConnectTicket::Ready => return Ok(()),
            ConnectTicket::Spawn(rx) => {
                info!(session_id = %self.inner.session_id, "Session connecting");
                tokio::spawn(driver::run(Arc::clone(&self.inner)));
                rx
            }
            ConnectTicket::Wait(rx) => rx,
        };
        rx.await
            .unwrap_or_else(|_| Err(Error::ConnectionClosed("session dropped".to_string())))
    }

    /// True only when the socket is open and authenticated.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a terminal frame.
    pub fn pending_requests(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Sends a request and waits for its terminal frame.
    ///
    /// `timeout` defaults to the configured request timeout. Fails with
    /// [`Error::NotConnected`] unless the session is ready.
    pub async fn send_and_await<T>(
        &self,
        kind: RequestKind,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Value, Error>
    where
        T: Serialize + ?Sized,
    {
        if !self.inner.is_connected() {
            return Err(Error::NotConnected);
        }
        let data = serde_json::to_value(payload)?;
        let (_, rx) = self.inner.submit(kind, data, timeout, None)?;
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Starts a streaming request. The payload must serialize to a JSON
    /// object; `"stream": true` is added to it.
    pub fn start_stream<T>(
        &self,
        kind: RequestKind,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<GenerationStream, Error>
    where
        T: Serialize + ?Sized,
    {
        if !self.inner.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut data = serde_json::to_value(payload)?;
        match data.as_object_mut() {
            Some(map) => {
                map.insert("stream".to_string(), Value::Bool(true));
            }
            None => {
                return Err(Error::InvalidPayload(
                    "stream payload must be a JSON object".to_string(),
                ))
            }
        }
        let (sink, chunks) = mpsc::unbounded_channel();
        let (id, rx) = self.inner.submit(kind, data, timeout, Some(sink))?;
        Ok(GenerationStream::new(id, chunks, rx, Arc::downgrade(&self.inner)))
    }

    /// Aborts a pending request by identifier. Returns false if it had
    /// already settled.
    pub fn abort(&self, request_id: &str) -> bool {
        self.inner.abort_request(request_id)
    }

    /// Closes the session.
    ///
    /// Every pending request is rejected with [`Error::ClientClosed`] before
    /// this returns. Reconnection is disabled for good. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Generates an image.
    pub async fn generate_image(&self, request: &ImageRequest) -> Result<Value, Error> {
        self.send_and_await(RequestKind::GenerateImage, request, None).await
    }

    /// Generates a video.
    pub async fn generate_video(&self, request: &VideoRequest) -> Result<Value, Error> {
        self.send_and_await(RequestKind::GenerateVideo, request, None).await
    }

    /// Upscales a previously generated image.
    pub async fn upscale(&self, request: &UpscaleRequest) -> Result<Value, Error> {
        self.send_and_await(RequestKind::Upscale, request, None).await
    }

    /// Streams text generation.
    pub fn stream_llm(&self, request: &LlmRequest) -> Result<GenerationStream, Error> {
        self.start_stream(RequestKind::GenerateLlm, request, None)
    }

    /// Streams a transcription.
    pub fn stream_stt(&self, request: &SttRequest) -> Result<GenerationStream, Error> {
        self.start_stream(RequestKind::GenerateStt, request, None)
    }

    /// Streams synthesized speech.
    pub fn stream_tts(&self, request: &TtsRequest) -> Result<GenerationStream, Error> {
        self.start_stream(RequestKind::GenerateTts, request, None)
    }

    /// Fetches the account settings.
    pub async fn get_settings(&self) -> Result<Value, Error> {
        self.send_and_await(RequestKind::GetSettings, &Value::Null, None).await
    }

    /// Replaces account settings with `settings`. Resolves with the stored settings.
    pub async fn update_settings(&self, settings: &Value) -> Result<Value, Error> {
        self.send_and_await(RequestKind::UpdateSettings, settings, None).await
    }

    /// Fetches usage counters for the account.
    pub async fn get_usage(&self) -> Result<Value, Error> {
        self.send_and_await(RequestKind::GetUsage, &Value::Null, None).await
    }

    /// Fetches the account's current rate limits.
    pub async fn get_rate_limits(&self) -> Result<Value, Error> {
        self.send_and_await(RequestKind::GetRateLimits, &Value::Null, None).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.inner.state())
            .finish()
    }
}
