//! Seams between the playback controller and whatever actually renders media.
//!
//! A [`PlaybackSurface`] is the thing that shows video. It either plays HLS on its own (the
//! "native" path) or gets fed by a [`StreamingSession`] created by a [`StreamingEngine`].

use crate::error::MediaError;
use reqwest::Url;
use std::fmt;
use std::future::Future;

pub mod engine;
pub mod surface;

pub use engine::{HttpSession, HttpStreamingEngine};
pub use surface::{ConfiguredSurface, ExternalPlayer, HeadlessSurface};

/// MIME type of an HLS manifest.
pub const HLS_MIME: &str = "application/vnd.apple.mpegurl";

/// Classification of streaming session errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    Network,
    Parsing,
    Media,
    Other,
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamErrorKind::Network => "network",
            StreamErrorKind::Parsing => "parsing",
            StreamErrorKind::Media => "media",
            StreamErrorKind::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The manifest loaded and parsed; `variants` is the number of renditions it offers.
    ManifestParsed { variants: usize },
    Error {
        /// Fatal errors cannot be recovered without rebuilding the session.
        fatal: bool,
        kind: StreamErrorKind,
        details: String,
    },
}

pub trait PlaybackSurface: Send + 'static {
    fn can_play_type(&self, mime: &str) -> bool;

    /// Native path: play the manifest directly.
    fn set_source(&mut self, manifest: &Url);

    /// Engine path: media will be supplied by a streaming session loading `manifest`.
    fn attach(&mut self, manifest: &Url);

    fn play(&mut self) -> impl Future<Output = Result<(), MediaError>> + Send;

    /// Resolves when the surface reports an error, and never otherwise.
    ///
    /// Must be cancel-safe.
    fn error(&mut self) -> impl Future<Output = MediaError> + Send;

    /// Stops playback and forgets the current source.
    fn reset(&mut self);
}

pub trait StreamingEngine: Send + Sync + 'static {
    type Session: StreamingSession;

    fn is_supported(&self) -> bool;

    /// Starts loading `manifest` in a new session.
    fn load(&self, manifest: &Url) -> Self::Session;
}

pub trait StreamingSession: Send + 'static {
    /// Next event from the session. Pending forever once the session has nothing more to say.
    ///
    /// Must be cancel-safe.
    fn next_event(&mut self) -> impl Future<Output = SessionEvent> + Send;

    /// Stops all loading. Calling it more than once is harmless.
    fn destroy(&mut self);
}
