//! The two state machines behind the session: the chat connection and media playback.

pub mod channel;
pub mod playback;

pub use channel::{ChannelCommand, ChannelMachine, ChatStatus, ConnectionState};
pub use playback::{Capabilities, PlaybackCommand, PlaybackMachine, PlaybackState};
