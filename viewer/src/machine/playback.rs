//! Load/play state machine for the room's adaptive stream.
//!
//! Like [`super::channel`], this only decides. The driver in [`crate::background::playback`]
//! owns the surface, the streaming session and the load timer, and executes the returned
//! [`PlaybackCommand`]s in order.

use crate::error::MediaError;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    /// "No live stream or VOD available currently." Terminal until the next restart.
    Unavailable,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaybackState::Idle => "Idle",
            PlaybackState::Loading => "Loading stream...",
            PlaybackState::Playing => "Playing",
            PlaybackState::Unavailable => "No live stream or VOD available currently.",
        })
    }
}

/// What the playback environment can do, sampled at the start of every load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The surface plays `application/vnd.apple.mpegurl` on its own.
    pub native_hls: bool,
    /// A streaming engine is available to feed the surface.
    pub engine: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Native,
    Engine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    /// Point the surface directly at the manifest URL.
    AssignSource,
    /// Create a streaming session for the manifest and attach it to the surface.
    StartSession,
    ArmTimeout(Duration),
    CancelTimeout,
    DestroySession,
    /// Start playback and report back through [`PlaybackMachine::on_play_result`].
    Play,
    /// Stop the surface and forget its source.
    ResetSurface,
}

#[derive(Debug, Clone)]
pub struct PlaybackMachine {
    state: PlaybackState,
    path: Option<Path>,
    session_active: bool,
    timer_armed: bool,
    load_timeout: Duration,
    failure: Option<MediaError>,
}

impl PlaybackMachine {
    pub fn new(load_timeout: Duration) -> Self {
        Self {
            state: PlaybackState::Idle,
            path: None,
            session_active: false,
            timer_armed: false,
            load_timeout,
            failure: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Why the last attempt ended in [`PlaybackState::Unavailable`], if it did.
    pub fn failure(&self) -> Option<&MediaError> {
        self.failure.as_ref()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    /// Releases everything the current attempt holds and returns to Idle.
    pub fn reset(&mut self) -> Vec<PlaybackCommand> {
        let mut commands = self.release();
        if self.path.take().is_some() {
            commands.push(PlaybackCommand::ResetSurface);
        }
        self.state = PlaybackState::Idle;
        self.failure = None;
        commands
    }

    /// Tears down any previous attempt and begins a fresh load.
    pub fn start(&mut self, caps: Capabilities) -> Vec<PlaybackCommand> {
        let mut commands = self.reset();
        self.state = PlaybackState::Loading;

        if caps.native_hls {
            self.path = Some(Path::Native);
            commands.extend([PlaybackCommand::AssignSource, PlaybackCommand::Play]);
        } else if caps.engine {
            self.path = Some(Path::Engine);
            self.session_active = true;
            self.timer_armed = true;
            commands.extend([
                PlaybackCommand::StartSession,
                PlaybackCommand::ArmTimeout(self.load_timeout),
            ]);
        } else {
            commands.extend(self.fail(MediaError::Unsupported));
        }
        commands
    }

    pub fn on_manifest_parsed(&mut self) -> Vec<PlaybackCommand> {
        if self.state != PlaybackState::Loading
            || self.path != Some(Path::Engine)
            || !self.timer_armed
        {
            return Vec::new();
        }
        self.timer_armed = false;
        vec![PlaybackCommand::CancelTimeout, PlaybackCommand::Play]
    }

    pub fn on_play_result(&mut self, result: Result<(), MediaError>) -> Vec<PlaybackCommand> {
        if self.state != PlaybackState::Loading {
            return Vec::new();
        }
        match result {
            Ok(()) => {
                self.state = PlaybackState::Playing;
                Vec::new()
            }
            Err(e) => self.fail(e),
        }
    }

    /// The surface itself reported an error (e.g. the external player died).
    pub fn on_surface_error(&mut self, error: MediaError) -> Vec<PlaybackCommand> {
        if !self.in_progress() {
            return Vec::new();
        }
        self.fail(error)
    }

    /// The streaming session reported an error. Only fatal ones end the attempt.
    pub fn on_stream_error(&mut self, fatal: bool, error: MediaError) -> Vec<PlaybackCommand> {
        if !fatal || !self.session_active || !self.in_progress() {
            return Vec::new();
        }
        self.fail(error)
    }

    pub fn on_timeout(&mut self) -> Vec<PlaybackCommand> {
        if !self.timer_armed || self.state != PlaybackState::Loading {
            return Vec::new();
        }
        // the timer fired on its own, nothing to cancel
        self.timer_armed = false;
        self.fail(MediaError::LoadTimeout(self.load_timeout))
    }

    fn in_progress(&self) -> bool {
        matches!(self.state, PlaybackState::Loading | PlaybackState::Playing)
    }

    fn release(&mut self) -> Vec<PlaybackCommand> {
        let mut commands = Vec::new();
        if std::mem::take(&mut self.timer_armed) {
            commands.push(PlaybackCommand::CancelTimeout);
        }
        if std::mem::take(&mut self.session_active) {
            commands.push(PlaybackCommand::DestroySession);
        }
        commands
    }

    fn fail(&mut self, error: MediaError) -> Vec<PlaybackCommand> {
        let commands = self.release();
        self.state = PlaybackState::Unavailable;
        self.failure = Some(error);
        commands
    }
}
