//! Wire types exchanged with the origin.

use serde::{Deserialize, Serialize};

/// Body of `GET /isLive?room=...`.
///
/// The server serializes its stream record with Go's default field names, hence the
/// capitalized keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamStatus {
    #[serde(default)]
    pub name: String,
    pub is_live: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewers: u32,
}

/// A chat line pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub code: i64,
    // `omitempty` on the server side
    #[serde(default)]
    pub timestamp: String,
    pub text: String,
}

/// A chat line sent by this client.
///
/// The server stamps messages that arrive without a timestamp, but clients always send their
/// own wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingChatMessage {
    pub timestamp: String,
    pub text: String,
}

impl OutgoingChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            timestamp: wall_clock_stamp(&jiff::Zoned::now()),
            text: text.into(),
        }
    }
}

/// `H:M` in local time with neither field zero-padded, e.g. `9:5` for five past nine.
pub fn wall_clock_stamp(now: &jiff::Zoned) -> String {
    format!("{}:{}", now.hour(), now.minute())
}
