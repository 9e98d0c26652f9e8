use crate::background::{
    ChatHandle, LivenessFact, TaskGuard, spawn_chat_task, spawn_liveness_poller,
    spawn_playback_task,
};
use crate::config::Config;
use crate::live_api::{ChatConnector, ChatMessage, LiveClient, StatusSource, WsConnector};
use crate::machine::{ChatStatus, ConnectionState, PlaybackState};
use crate::media::{ConfiguredSurface, HttpStreamingEngine, PlaybackSurface, StreamingEngine};
use eyre::Context;
use tokio::sync::watch;

/// Everything one viewer has open for one room.
///
/// Mounting starts the liveness poller, the chat channel and the playback controller;
/// [`ViewerSession::unmount`] (or dropping the session) stops all three along with every
/// socket, session and timer they hold.
#[derive(Debug)]
pub struct ViewerSession {
    liveness: watch::Receiver<Option<LivenessFact>>,
    playback: watch::Receiver<PlaybackState>,
    chat: ChatHandle,
    tasks: Vec<TaskGuard>,
}

impl ViewerSession {
    /// Mounts a session against the origin in `config`, using real HTTP, WebSocket and
    /// playback collaborators.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mount(config: &Config) -> eyre::Result<Self> {
        let http = LiveClient::http_client(config.insecure).context("build HTTP client")?;
        let status = LiveClient::new(http.clone(), config).context("build status client")?;
        let connector = WsConnector::new(config.insecure).context("build chat TLS connector")?;
        let engine = HttpStreamingEngine::new(http);
        let surface = ConfiguredSurface::from_player(config.player.as_deref());
        Self::mount_with(config, status, connector, engine, surface)
    }

    /// Like [`ViewerSession::mount`], with caller-provided collaborators.
    pub fn mount_with<P, C, E, S>(
        config: &Config,
        status: P,
        connector: C,
        engine: E,
        surface: S,
    ) -> eyre::Result<Self>
    where
        P: StatusSource,
        C: ChatConnector,
        E: StreamingEngine,
        S: PlaybackSurface,
    {
        let chat_url = config.chat_url().context("derive chat URL")?;
        let manifest = config.manifest_url().context("derive manifest URL")?;

        let (liveness_tx, liveness) = watch::channel(None);
        let (chat, chat_task) =
            spawn_chat_task(connector, chat_url, config.reconnect, liveness.clone());
        let (playback, playback_task) = spawn_playback_task(
            engine,
            surface,
            manifest,
            config.load_timeout,
            liveness.clone(),
        );
        let poller = spawn_liveness_poller(status, config.poll_interval, liveness_tx);
        tracing::info!(room = %config.room, origin = %config.origin, "mounted viewer session");

        Ok(Self {
            liveness,
            playback,
            chat,
            tasks: vec![poller, chat_task, playback_task],
        })
    }

    /// The current liveness fact. `None` until the first successful poll.
    pub fn liveness(&self) -> watch::Receiver<Option<LivenessFact>> {
        self.liveness.clone()
    }

    pub fn playback(&self) -> watch::Receiver<PlaybackState> {
        self.playback.clone()
    }

    pub fn chat(&self) -> &ChatHandle {
        &self.chat
    }

    pub fn chat_history(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.chat.history()
    }

    pub fn chat_status(&self) -> watch::Receiver<ChatStatus> {
        self.chat.status()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.chat.state()
    }

    /// See [`ChatHandle::send`].
    pub fn send(&self, text: impl Into<String>) {
        self.chat.send(text);
    }

    /// Stops every task and waits until they are gone.
    pub async fn unmount(self) {
        for task in self.tasks {
            let name = task.name();
            task.shutdown().await;
            tracing::debug!(task = name, "stopped");
        }
        tracing::info!("unmounted viewer session");
    }
}
