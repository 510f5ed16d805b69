//! Connection driver.
//!
//! One task per session owns the socket's read half. It runs the auth
//! handshake, the heartbeat and inbound dispatch for the current socket, and
//! when the socket is lost abnormally it loops through backoff and reconnect.
//! The attempt counter lives on the session, not in the loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::messages::{ClientFrame, InboundFrame};
use crate::reconnect::Backoff;
use crate::session::{ConnectionState, Inner};
use crate::stream::StreamChunk;
use crate::ws::{Outbound, WebSocket};

/// Why a socket stopped being usable.
#[derive(Debug)]
enum Disconnect {
    /// The caller closed the session.
    ClientClosed,
    /// The server closed with the normal-closure code.
    Normal(String),
    /// Anything else: dropped TCP, error close codes, failed writes.
    Abnormal(String),
    /// Credential rejected on the initial connect.
    AuthRejected(String),
    /// No answer to the auth frame.
    HandshakeTimeout,
}

impl Disconnect {
    fn into_error(self) -> Error {
        match self {
            Disconnect::ClientClosed => Error::ClientClosed,
            Disconnect::Normal(reason) | Disconnect::Abnormal(reason) => {
                Error::ConnectionClosed(reason)
            }
            Disconnect::AuthRejected(message) => Error::Authentication(message),
            Disconnect::HandshakeTimeout => Error::HandshakeTimeout,
        }
    }
}

pub(crate) async fn run(inner: Arc<Inner>) {
    let backoff = Backoff::from_config(&inner.config);
    // Set once a handshake has succeeded. Before that, failures go back to
    // the connect() callers; after it, abnormal losses are recovered.
    let mut recovering = false;

    let final_error = loop {
        if inner.is_closed() {
            break Error::ClientClosed;
        }
        inner.set_state(ConnectionState::Connecting);

        let outcome = match WebSocket::connect(&inner.config.endpoint, inner.config.connect_timeout).await {
            Ok(ws) => {
                let (outcome, became_ready) = drive(&inner, ws, !recovering).await;
                recovering |= became_ready;
                outcome
            }
            Err(e) if !recovering => {
                error!(session_id = %inner.session_id, error = %e, "Connection failed");
                break e;
            }
            Err(e) => Disconnect::Abnormal(e.to_string()),
        };

        match outcome {
            Disconnect::ClientClosed => break Error::ClientClosed,
            Disconnect::Normal(reason) => {
                info!(session_id = %inner.session_id, reason = %reason, "Server closed the connection");
                break Error::ConnectionClosed(reason);
            }
            other if !recovering => {
                warn!(session_id = %inner.session_id, outcome = ?other, "Initial connection failed");
                break other.into_error();
            }
            other => {
                warn!(session_id = %inner.session_id, outcome = ?other, "Connection lost");
            }
        }

        if !inner.config.auto_reconnect {
            info!(session_id = %inner.session_id, "Auto-reconnect disabled");
            break Error::ConnectionClosed("connection lost".to_string());
        }

        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = inner.config.max_reconnect_attempts {
            if attempt >= max {
                error!(session_id = %inner.session_id, attempts = attempt, "Reconnect attempts exhausted");
                let err = Error::ReconnectExhausted(max);
                inner.table.lock().reject_all(&err);
                break err;
            }
        }

        let delay = backoff.delay(attempt);
        inner.set_state(ConnectionState::Reconnecting);
        info!(
            session_id = %inner.session_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => break Error::ClientClosed,
        }
    };

    inner.finish(final_error);
    debug!(session_id = %inner.session_id, "Driver stopped");
}

/// Runs one socket until it stops being usable. Returns why, and whether the
/// handshake succeeded on it.
async fn drive(inner: &Arc<Inner>, ws: WebSocket, initial: bool) -> (Disconnect, bool) {
    let WebSocket { outbound, mut reader } = ws;
    if !inner.install_transport(outbound.clone()) {
        outbound.close(CloseCode::Normal, "client closed");
        return (Disconnect::ClientClosed, false);
    }
    inner.set_state(ConnectionState::Authenticating);

    let sent = ClientFrame::auth(&inner.config.api_key)
        .to_text()
        .and_then(|auth| outbound.send_text(auth));
    if let Err(e) = sent {
        inner.clear_transport();
        return (Disconnect::Abnormal(e.to_string()), false);
    }
    debug!(session_id = %inner.session_id, "Auth frame sent");

    let mut ready = false;
    let handshake = tokio::time::sleep(inner.config.auth_timeout);
    tokio::pin!(handshake);
    // A zero interval disables the heartbeat.
    let heartbeat_enabled = !inner.config.heartbeat_interval.is_zero();
    let period = inner.config.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break Disconnect::ClientClosed,
            _ = &mut handshake, if !ready => {
                warn!(session_id = %inner.session_id, "Authentication handshake timed out");
                break Disconnect::HandshakeTimeout;
            }
            _ = heartbeat.tick(), if ready && heartbeat_enabled => {
                if outbound.send_ping().is_err() {
                    break Disconnect::Abnormal("heartbeat send failed".to_string());
                }
            }
            msg = reader.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Invalid UTF-8 in binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_))) => {
                        debug!("Received ping");
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => break classify_close(&outbound, frame),
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) if outbound.is_closing() => {
                        debug!(error = %e, "Read error after close");
                        break Disconnect::ClientClosed;
                    }
                    Some(Err(e)) => break Disconnect::Abnormal(e.to_string()),
                    None if outbound.is_closing() => break Disconnect::ClientClosed,
                    None => break Disconnect::Abnormal("stream ended".to_string()),
                };

                let was_ready = ready;
                if let Some(disconnect) = dispatch(inner, &outbound, &text, initial, &mut ready) {
                    break disconnect;
                }
                if ready && !was_ready {
                    heartbeat.reset();
                }
            }
        }
    };

    inner.clear_transport();
    (outcome, ready)
}

fn classify_close(outbound: &Outbound, frame: Option<CloseFrame<'static>>) -> Disconnect {
    if outbound.is_closing() {
        return Disconnect::ClientClosed;
    }
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => Disconnect::Normal(frame.reason.to_string()),
        Some(frame) => Disconnect::Abnormal(format!(
            "closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
        None => Disconnect::Abnormal("closed without status".to_string()),
    }
}

/// Routes one inbound frame. Frames whose identifier is not in the table are
/// dropped without invoking anything.
fn dispatch(
    inner: &Inner,
    outbound: &Outbound,
    text: &str,
    initial: bool,
    ready: &mut bool,
) -> Option<Disconnect> {
    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "Failed to parse frame");
            return None;
        }
    };

    match frame {
        InboundFrame::AuthSuccess => {
            if *ready {
                debug!("Duplicate auth_success ignored");
            } else {
                info!(session_id = %inner.session_id, "Authenticated");
                *ready = true;
                inner.on_authenticated(outbound);
            }
        }
        InboundFrame::AuthFailure { message } => {
            error!(session_id = %inner.session_id, message = %message, "Authentication rejected");
            if initial && !*ready {
                return Some(Disconnect::AuthRejected(message));
            }
        }
        InboundFrame::Error {
            request_id: Some(id),
            code,
            message,
        } => {
            let rejected = inner.table.lock().reject(
                &id,
                Error::Server {
                    code: code.clone(),
                    message: message.clone(),
                },
            );
            if rejected {
                error!(request_id = %id, code = %code, message = %message, "Server error");
            } else {
                debug!(request_id = %id, "Dropping error for unknown request");
            }
        }
        InboundFrame::Error {
            request_id: None,
            code,
            message,
        } => {
            error!(code = %code, message = %message, "Server error");
        }
        InboundFrame::Complete { request_id, result } => settle(inner, request_id, result),
        InboundFrame::Response {
            request_id, data, ..
        } => settle(inner, request_id, data),
        InboundFrame::Chunk {
            request_id: Some(id),
            kind,
            data,
        } => {
            if !inner
                .table
                .lock()
                .deliver_chunk(&id, StreamChunk::new(kind, data))
            {
                debug!(request_id = %id, "Dropping chunk for unknown request");
            }
        }
        InboundFrame::Chunk {
            request_id: None, ..
        } => {
            debug!("Dropping chunk without requestId");
        }
        InboundFrame::Unknown { msg_type } => {
            warn!(msg_type = %msg_type, "Unknown frame type");
        }
    }
    None
}

fn settle(inner: &Inner, request_id: Option<String>, result: serde_json::Value) {
    let Some(id) = request_id else {
        debug!("Dropping terminal frame without requestId");
        return;
    };
    if inner.table.lock().resolve(&id, result) {
        debug!(request_id = %id, "Request completed");
    } else {
        debug!(request_id = %id, "Dropping terminal frame for unknown request");
    }
}
