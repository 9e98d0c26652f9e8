//! Failure taxonomy for the session controller.
//!
//! None of these are ever returned to the hosting application. Each component catches its own
//! failures, logs them, and folds them into observable state instead.

use thiserror::Error;

/// A request to the origin did not complete successfully.
///
/// Always recovered locally: the poller keeps the previous fact, the chat channel schedules a
/// reconnect.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("origin does not know room '{room}'")]
    UnknownRoom { room: String },

    #[error("could not decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("websocket failure")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no answer from {target} within {after:?}")]
    Timeout {
        target: String,
        after: std::time::Duration,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// An inbound payload that could not be understood. Dropped after logging.
#[derive(Error, Debug)]
#[error("malformed chat frame {payload:?}")]
pub struct ProtocolError {
    pub payload: String,
    #[source]
    pub source: serde_json::Error,
}

/// Why playback ended up unavailable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("playback surface refused to play: {0}")]
    PlayRejected(String),

    #[error("playback surface reported an error: {0}")]
    Surface(String),

    #[error("{kind} error in streaming session: {details}")]
    Stream {
        kind: crate::media::StreamErrorKind,
        details: String,
    },

    #[error("manifest was not parsed within {0:?}")]
    LoadTimeout(std::time::Duration),

    #[error("no way to play adaptive streams on this surface")]
    Unsupported,
}
