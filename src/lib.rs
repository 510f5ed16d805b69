//! Rust client for an AI generation service's WebSocket API.
//!
//! A [`Session`] owns one authenticated WebSocket and multiplexes any number
//! of concurrent requests over it by request identifier. Plain requests
//! resolve once with their result; streaming requests deliver chunks before
//! their terminal result. Abnormal connection loss is recovered with capped
//! exponential backoff, and requests still in flight are replayed on the new
//! connection.
//!
//! # Example
//!
//! ```no_run
//! use rust_aigen::{LlmRequest, Session, SessionConfig, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rust_aigen::Error> {
//!     let config = SessionConfig::from_env("wss://api.example.com/ws")?;
//!     let session = Session::new(config);
//!     session.connect().await?;
//!
//!     let mut stream = session.stream_llm(&LlmRequest::new("Write a haiku"))?;
//!     while let Some(event) = stream.next_event().await {
//!         match event {
//!             StreamEvent::Chunk(chunk) => print!("{}", chunk.text().unwrap_or_default()),
//!             StreamEvent::Complete(result) => println!("\n{}", result),
//!             StreamEvent::Error(e) => return Err(e),
//!         }
//!     }
//!
//!     session.close();
//!     Ok(())
//! }
//! ```

mod config;
mod correlation;
mod driver;
mod error;
mod messages;
mod reconnect;
mod requests;
mod session;
mod stream;
mod ws;

pub use config::{SessionConfig, API_KEY_ENV};
pub use error::Error;
pub use messages::{ChunkKind, ClientFrame, InboundFrame, RequestKind, ResponseKind};
pub use reconnect::Backoff;
pub use requests::*;
pub use session::{ConnectionState, Session};
pub use stream::{GenerationStream, StreamChunk, StreamEvent};
