//! Drives [`PlaybackMachine`] against a real surface, streaming engine and load timer.

use crate::background::{LivenessFact, TaskGuard, set_if_changed};
use crate::error::MediaError;
use crate::machine::{Capabilities, PlaybackCommand, PlaybackMachine, PlaybackState};
use crate::media::{HLS_MIME, PlaybackSurface, SessionEvent, StreamingEngine, StreamingSession};
use reqwest::Url;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Owns everything a load holds and carries out what [`PlaybackMachine`] asks for.
struct PlaybackDriver<E: StreamingEngine, S: PlaybackSurface> {
    /// Starts a streaming session when the surface cannot play HLS itself.
    engine: E,
    /// Where the stream is shown.
    surface: S,
    /// The room's HLS manifest, used for both the native and the engine path.
    manifest: Url,
    machine: PlaybackMachine,
    /// The engine session of the current load, if it took the engine path.
    session: Option<E::Session>,
    /// When the current manifest load times out.
    deadline: Option<Instant>,
    state: watch::Sender<PlaybackState>,
}

/// Spawn the playback controller for `manifest`.
///
/// Loads once right away, then starts over from scratch every time the room's `is_live`
/// flips. Nothing else restarts it: a failed load stays [`PlaybackState::Unavailable`].
pub fn spawn_playback_task<E, S>(
    engine: E,
    surface: S,
    manifest: Url,
    load_timeout: Duration,
    mut liveness: watch::Receiver<Option<LivenessFact>>,
) -> (watch::Receiver<PlaybackState>, TaskGuard)
where
    E: StreamingEngine,
    S: PlaybackSurface,
{
    let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
    let mut driver = PlaybackDriver {
        engine,
        surface,
        manifest,
        machine: PlaybackMachine::new(load_timeout),
        session: None,
        deadline: None,
        state: state_tx,
    };

    let guard = TaskGuard::spawn("playback", async move {
        let mut live = liveness_key(&liveness.borrow_and_update());
        driver.restart().await;

        loop {
            let deadline = driver.deadline;
            tokio::select! {
                changed = liveness.changed() => {
                    if changed.is_err() {
                        tracing::debug!("liveness publisher is gone - stopping playback");
                        break;
                    }
                    let next = liveness_key(&liveness.borrow_and_update());
                    if next != live {
                        tracing::info!(is_live = ?next, "liveness flipped - reloading stream");
                        live = next;
                        driver.restart().await;
                    }
                }
                event = next_event(&mut driver.session) => driver.on_session_event(event).await,
                error = driver.surface.error() => {
                    let commands = driver.machine.on_surface_error(error);
                    driver.run(commands).await;
                }
                () = sleep_until(deadline) => {
                    driver.deadline = None;
                    tracing::debug!(manifest = %driver.manifest, "manifest load timed out");
                    let commands = driver.machine.on_timeout();
                    driver.run(commands).await;
                }
            }
        }
    });

    (state_rx, guard)
}

/// The part of the fact that playback reacts to. A title change alone is not a reason to
/// reload.
fn liveness_key(fact: &Option<LivenessFact>) -> Option<bool> {
    fact.as_ref().map(|f| f.is_live)
}

async fn next_event<T: StreamingSession>(session: &mut Option<T>) -> SessionEvent {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<E: StreamingEngine, S: PlaybackSurface> PlaybackDriver<E, S> {
    async fn restart(&mut self) {
        let commands = self.machine.reset();
        self.run(commands).await;

        let caps = Capabilities {
            native_hls: self.surface.can_play_type(HLS_MIME),
            engine: self.engine.is_supported(),
        };
        tracing::debug!(?caps, manifest = %self.manifest, "loading stream");
        let commands = self.machine.start(caps);
        self.run(commands).await;
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        let commands = match event {
            SessionEvent::ManifestParsed { variants } => {
                tracing::debug!(variants, "manifest parsed");
                self.machine.on_manifest_parsed()
            }
            SessionEvent::Error {
                fatal,
                kind,
                details,
            } => {
                if !fatal {
                    tracing::warn!(%kind, %details, "recoverable streaming error");
                }
                self.machine
                    .on_stream_error(fatal, MediaError::Stream { kind, details })
            }
        };
        self.run(commands).await;
    }

    /// Carries out `commands` in order, along with whatever they lead to.
    async fn run(&mut self, commands: Vec<PlaybackCommand>) {
        let mut queue = VecDeque::from(commands);
        while let Some(command) = queue.pop_front() {
            match command {
                PlaybackCommand::AssignSource => self.surface.set_source(&self.manifest),
                PlaybackCommand::StartSession => {
                    let session = self.engine.load(&self.manifest);
                    self.surface.attach(&self.manifest);
                    self.session = Some(session);
                }
                PlaybackCommand::ArmTimeout(timeout) => {
                    self.deadline = Some(Instant::now() + timeout);
                }
                PlaybackCommand::CancelTimeout => self.deadline = None,
                PlaybackCommand::DestroySession => {
                    if let Some(mut session) = self.session.take() {
                        session.destroy();
                    }
                }
                PlaybackCommand::Play => {
                    let result = self.surface.play().await;
                    queue.extend(self.machine.on_play_result(result));
                }
                PlaybackCommand::ResetSurface => self.surface.reset(),
            }
        }

        let state = self.machine.state();
        if !set_if_changed(&self.state, state) {
            return;
        }
        match (state, self.machine.failure()) {
            (PlaybackState::Unavailable, Some(reason)) => {
                tracing::warn!(%reason, "{state}");
            }
            (PlaybackState::Playing, _) => tracing::info!(manifest = %self.manifest, "playing"),
            _ => {}
        }
    }
}

impl<E: StreamingEngine, S: PlaybackSurface> Drop for PlaybackDriver<E, S> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.destroy();
        }
        self.surface.reset();
    }
}
