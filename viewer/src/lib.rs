//! Keeps a viewer in sync with one live room.
//!
//! A [`ViewerSession`] polls the origin for whether the room is live, keeps a chat socket open
//! while it is, and loads the room's HLS stream, starting over whenever the room goes live or
//! offline. Failures never escape: they end up as [`ChatStatus`] or [`PlaybackState`].

pub mod background;
pub mod config;
pub mod error;
pub mod live_api;
pub mod machine;
pub mod media;
mod session;

pub use background::LivenessFact;
pub use config::{Config, ReconnectPolicy};
pub use error::{MediaError, ProtocolError, TransportError};
pub use machine::{ChatStatus, ConnectionState, PlaybackState};
pub use session::ViewerSession;
