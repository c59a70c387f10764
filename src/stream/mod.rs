// Filtered stream consumer.
//
// - `envelope`: wire types and the pure line decoder.
// - `reader`: dispatches decoded lines to an `EventHandler` and reads one
//   connection until it ends, stalls, or is cancelled.
// - `backoff`: reconnect wait computation.
// - `consumer`: the reconnect loop that ties the above together.
// - `rules`: stream rule management used by `watch --auto-setup`.

pub mod backoff;
pub mod consumer;
pub mod envelope;
pub mod reader;
pub mod rules;

use thiserror::Error;

use crate::api::GatewayError;

pub use backoff::{Backoff, BackoffPolicy, BackoffReset};
pub use consumer::{ConnectionState, DisconnectNotice, SessionStats, StopReason, StreamConsumer};
pub use envelope::{decode_line, Includes, LineOutcome, StreamEnvelope, Tweet, User};
pub use reader::{EventHandler, FeedCounters, Flow, ReadOutcome};

pub const STREAM_PATH: &str = "2/tweets/search/stream";

/// Conditions that end a stream session with an error. Disconnects and bad
/// lines never show up here; they are handled inside the consumer.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The server rejected the first connection of the session.
    #[error("connect to filtered stream: {0}")]
    Connect(#[source] GatewayError),
    #[error("event handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("start stream reader thread: {0}")]
    Spawn(#[source] std::io::Error),
}
