use crate::error::TransportError;
use reqwest::Url;
use std::time::Duration;

/// Default origin: the web server runs on the same host with a
/// self-signed certificate.
pub const DEFAULT_ORIGIN: &str = "https://localhost:443";

/// Exponential backoff policy for the chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempts` earlier retries.
    ///
    /// `min(base * 2^attempts, max)`, saturating rather than overflowing for absurd counts.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Scheme, host and port of the server that hosts the status endpoint, chat socket and HLS
    /// files.
    pub origin: Url,
    pub room: String,
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub load_timeout: Duration,
    /// External program used to play the stream natively (e.g. `mpv`). `None` keeps playback
    /// headless.
    pub player: Option<String>,
    /// Accept self-signed or otherwise invalid TLS certificates.
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            room: String::new(),
            poll_interval: Duration::from_millis(10_000),
            reconnect: ReconnectPolicy::default(),
            load_timeout: Duration::from_millis(10_000),
            player: None,
            insecure: false,
        }
    }
}

impl Config {
    pub fn new(origin: Url, room: impl Into<String>) -> Self {
        Self {
            origin,
            room: room.into(),
            ..Self::default()
        }
    }

    /// `{origin}/isLive?room={room}`
    pub fn status_url(&self) -> Result<Url, TransportError> {
        let mut url = self.endpoint(["isLive"])?;
        url.query_pairs_mut().append_pair("room", &self.room);
        Ok(url)
    }

    /// `{origin}/chat?room={room}`, with the scheme switched to its WebSocket counterpart.
    pub fn chat_url(&self) -> Result<Url, TransportError> {
        let mut url = self.endpoint(["chat"])?;
        url.query_pairs_mut().append_pair("room", &self.room);
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{other}' for chat"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(format!("cannot switch {url} to {scheme}")))?;
        Ok(url)
    }

    /// `{origin}/hls/{room}/index.m3u8`, with the room percent-encoded as one path segment.
    pub fn manifest_url(&self) -> Result<Url, TransportError> {
        self.endpoint(["hls", self.room.as_str(), "index.m3u8"])
    }

    /// Appends `segments` to the origin's path, keeping any path the origin already has.
    fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, TransportError> {
        let mut url = self.origin.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidUrl(format!("{} cannot be a base", self.origin)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}
