use crate::error::MediaError;
use crate::media::{HLS_MIME, PlaybackSurface};
use reqwest::Url;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A surface with nothing to render to.
///
/// It cannot play HLS by itself, so the controller takes the engine path. Playing succeeds
/// whenever there is something to play, which makes the session useful as a pure monitor.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    source: Option<Url>,
    playing: bool,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self) -> Option<&Url> {
        self.source.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

impl PlaybackSurface for HeadlessSurface {
    fn can_play_type(&self, _mime: &str) -> bool {
        false
    }

    fn set_source(&mut self, manifest: &Url) {
        self.source = Some(manifest.clone());
    }

    fn attach(&mut self, manifest: &Url) {
        self.source = Some(manifest.clone());
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() {
            return Err(MediaError::PlayRejected(String::from("no source")));
        }
        self.playing = true;
        Ok(())
    }

    async fn error(&mut self) -> MediaError {
        std::future::pending().await
    }

    fn reset(&mut self) {
        self.source = None;
        self.playing = false;
    }
}

/// Plays the stream in an external program that understands HLS itself, such as `mpv` or
/// `ffplay`.
#[derive(Debug)]
pub struct ExternalPlayer {
    program: String,
    args: Vec<String>,
    source: Option<Url>,
    child: Option<Child>,
}

impl ExternalPlayer {
    /// `command` is split on whitespace: the first word is the program, the rest are passed
    /// before the manifest URL.
    pub fn new(command: &str) -> Self {
        let mut words = command.split_whitespace().map(String::from);
        Self {
            program: words.next().unwrap_or_default(),
            args: words.collect(),
            source: None,
            child: None,
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!(program = %self.program, "stopping external player");
            if let Err(e) = child.start_kill() {
                tracing::trace!(error = %e, "external player already gone");
            }
        }
    }
}

impl PlaybackSurface for ExternalPlayer {
    fn can_play_type(&self, mime: &str) -> bool {
        !self.program.is_empty() && mime == HLS_MIME
    }

    fn set_source(&mut self, manifest: &Url) {
        self.source = Some(manifest.clone());
    }

    fn attach(&mut self, manifest: &Url) {
        self.source = Some(manifest.clone());
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        let Some(source) = self.source.clone() else {
            return Err(MediaError::PlayRejected(String::from("no source")));
        };
        self.stop();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(source.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::PlayRejected(format!("spawn {}: {e}", self.program)))?;
        tracing::info!(program = %self.program, pid = child.id(), %source, "started external player");
        self.child = Some(child);
        Ok(())
    }

    async fn error(&mut self) -> MediaError {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = child.wait().await;
        self.child = None;
        match status {
            Ok(status) if status.success() => {
                tracing::info!(program = %self.program, "external player exited");
                std::future::pending().await
            }
            Ok(status) => MediaError::Surface(format!("{} exited with {status}", self.program)),
            Err(e) => MediaError::Surface(format!("wait for {}: {e}", self.program)),
        }
    }

    fn reset(&mut self) {
        self.stop();
        self.source = None;
    }
}

/// The surface selected by [`crate::Config::player`].
#[derive(Debug)]
pub enum ConfiguredSurface {
    Headless(HeadlessSurface),
    External(ExternalPlayer),
}

impl ConfiguredSurface {
    pub fn from_player(player: Option<&str>) -> Self {
        match player {
            Some(command) if !command.trim().is_empty() => {
                ConfiguredSurface::External(ExternalPlayer::new(command))
            }
            _ => ConfiguredSurface::Headless(HeadlessSurface::new()),
        }
    }
}

impl PlaybackSurface for ConfiguredSurface {
    fn can_play_type(&self, mime: &str) -> bool {
        match self {
            ConfiguredSurface::Headless(s) => s.can_play_type(mime),
            ConfiguredSurface::External(s) => s.can_play_type(mime),
        }
    }

    fn set_source(&mut self, manifest: &Url) {
        match self {
            ConfiguredSurface::Headless(s) => s.set_source(manifest),
            ConfiguredSurface::External(s) => s.set_source(manifest),
        }
    }

    fn attach(&mut self, manifest: &Url) {
        match self {
            ConfiguredSurface::Headless(s) => s.attach(manifest),
            ConfiguredSurface::External(s) => s.attach(manifest),
        }
    }

    async fn play(&mut self) -> Result<(), MediaError> {
        match self {
            ConfiguredSurface::Headless(s) => s.play().await,
            ConfiguredSurface::External(s) => s.play().await,
        }
    }

    async fn error(&mut self) -> MediaError {
        match self {
            ConfiguredSurface::Headless(s) => s.error().await,
            ConfiguredSurface::External(s) => s.error().await,
        }
    }

    fn reset(&mut self) {
        match self {
            ConfiguredSurface::Headless(s) => s.reset(),
            ConfiguredSurface::External(s) => s.reset(),
        }
    }
}
