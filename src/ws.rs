//! WebSocket transport wrapper.
//!
//! The write half is owned by a small writer task fed through an unbounded
//! queue, so sending a frame never awaits. The read half is handed to the
//! session driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Read half of a live connection.
pub(crate) type WsReader = SplitStream<WsStream>;

const USER_AGENT: &str = concat!("rust-aigen/", env!("CARGO_PKG_VERSION"));

/// Write half of a live connection.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    closing: Arc<AtomicBool>,
}

impl Outbound {
    /// Queues a text frame.
    pub fn send_text(&self, text: String) -> Result<(), Error> {
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::NotConnected)
    }

    /// Queues a heartbeat ping.
    pub fn send_ping(&self) -> Result<(), Error> {
        debug!("Sending ping");
        self.tx
            .send(Message::Ping(b"ping".to_vec()))
            .map_err(|_| Error::NotConnected)
    }

    /// Starts a graceful close. The close event that follows is reported as
    /// caller-initiated.
    pub fn close(&self, code: CloseCode, reason: &str) {
        info!(reason = %reason, "WebSocket closing");
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }

    /// Returns true once `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Returns true while the writer task is accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.is_closing()
    }
}

/// A freshly opened WebSocket connection.
pub(crate) struct WebSocket {
    pub outbound: Outbound,
    pub reader: WsReader,
}

impl WebSocket {
    /// Opens a new WebSocket connection to the given URL.
    pub async fn connect(url: &str, conn_timeout: Duration) -> Result<Self, Error> {
        info!(url = %url, "WebSocket connecting");

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::InvalidEndpoint(e.to_string()))?;
        request
            .headers_mut()
            .insert("User-Agent", HeaderValue::from_static(USER_AGENT));

        let (ws_stream, _) = timeout(conn_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        info!(url = %url, "WebSocket connected");

        let (write, reader) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write, rx));

        Ok(Self {
            outbound: Outbound {
                tx,
                closing: Arc::new(AtomicBool::new(false)),
            },
            reader,
        })
    }
}

async fn write_loop(
    mut writer: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = writer.send(msg).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = writer.close().await;
    debug!("WebSocket writer finished");
}
