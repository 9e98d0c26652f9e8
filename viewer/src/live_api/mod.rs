//! Clients for the three endpoints the origin exposes for a room.
//!
//! - `GET /isLive?room=...` reports whether the room is broadcasting ([`client`]).
//! - `/chat?room=...` is a WebSocket carrying JSON chat lines ([`chat`]).
//! - `/hls/{room}/index.m3u8` is the adaptive stream manifest, consumed by
//!   [`crate::media::engine`].

pub mod chat;
pub mod client;
pub mod types;

pub use chat::{ChatConnection, ChatConnector, WsConnection, WsConnector};
pub use client::{LiveClient, StatusSource};
pub use types::{ChatMessage, OutgoingChatMessage, StreamStatus};
