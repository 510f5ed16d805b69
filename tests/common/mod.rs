//! In-process WebSocket server used to script the remote side.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_aigen::{Session, SessionConfig};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const API_KEY: &str = "test-key";
const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Short timings so reconnect tests finish quickly.
pub fn test_config(url: &str) -> SessionConfig {
    let mut config = SessionConfig::new(url, API_KEY);
    config.reconnect_interval = Duration::from_millis(50);
    config.max_reconnect_interval = Duration::from_millis(200);
    config.request_timeout = Duration::from_secs(5);
    config.auth_timeout = Duration::from_secs(2);
    config.connect_timeout = Duration::from_secs(2);
    config
}

pub struct MockServer {
    pub url: String,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let tx = tx.clone();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = tx.send(ServerConn { ws });
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}", addr),
            conns: rx,
            accepted,
        }
    }

    /// Number of completed WebSocket handshakes.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection arrived")
            .expect("listener stopped")
    }

    /// Accepts a connection, checks the auth frame and confirms it.
    pub async fn accept_authenticated(&mut self) -> ServerConn {
        let mut conn = self.accept().await;
        conn.expect_auth().await;
        conn.send_json(json!({"type": "auth_success"})).await;
        conn
    }

    pub async fn expect_no_connection(&mut self, within: Duration) {
        assert!(
            timeout(within, self.conns.recv()).await.is_err(),
            "unexpected connection"
        );
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next non-control message, or `None` once the client is gone.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            match timeout(WAIT, self.ws.next()).await.expect("client went silent") {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(msg)) => return Some(msg),
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        match self.recv_message().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Waits for a heartbeat ping.
    pub async fn recv_ping(&mut self) {
        loop {
            match timeout(WAIT, self.ws.next()).await.expect("no ping arrived") {
                Some(Ok(Message::Ping(_))) => return,
                Some(Ok(_)) => continue,
                other => panic!("connection ended before ping: {:?}", other),
            }
        }
    }

    pub async fn expect_auth(&mut self) {
        let frame = self.recv_json().await;
        assert_eq!(frame["type"], "auth");
        assert_eq!(frame["data"]["apiKey"], API_KEY);
    }

    /// Asserts the client sends no text frame for `within`.
    pub async fn expect_silence(&mut self, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text),
                Ok(Some(Ok(_))) => continue,
                Ok(_) => return,
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn complete(&mut self, request_id: &Value, result: Value) {
        self.send_json(json!({
            "type": "generation_complete",
            "requestId": request_id,
            "data": { "result": result },
        }))
        .await;
    }

    pub async fn close_with(&mut self, code: CloseCode, reason: &str) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            }))
            .await;
    }
}

/// Connects a fresh session against `server`.
pub async fn connected_session(
    server: &mut MockServer,
    config: SessionConfig,
) -> (Session, ServerConn) {
    let session = Session::new(config);
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    let conn = server.accept_authenticated().await;
    connecting.await.unwrap().unwrap();
    (session, conn)
}

/// Waits until the session reports `state`.
pub async fn wait_for_state(session: &Session, state: rust_aigen::ConnectionState) {
    let mut rx = session.watch_state();
    timeout(WAIT, async {
        while *rx.borrow_and_update() != state {
            if rx.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await
    .expect("state not reached");
}
