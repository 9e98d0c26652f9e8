//! A minimal HLS streaming engine that loads and validates the manifest over HTTP.

use crate::media::{SessionEvent, StreamErrorKind, StreamingEngine, StreamingSession};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct HttpStreamingEngine {
    client: reqwest::Client,
}

impl HttpStreamingEngine {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl StreamingEngine for HttpStreamingEngine {
    type Session = HttpSession;

    fn is_supported(&self) -> bool {
        true
    }

    fn load(&self, manifest: &Url) -> HttpSession {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(load_manifest(self.client.clone(), manifest.clone(), tx));
        HttpSession {
            events: rx,
            task: Some(task),
        }
    }
}

#[derive(Debug)]
pub struct HttpSession {
    events: mpsc::Receiver<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl StreamingSession for HttpSession {
    async fn next_event(&mut self) -> SessionEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    fn destroy(&mut self) {
        if let Some(task) = self.task.take() {
            tracing::trace!("destroying streaming session");
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// What a manifest offers, as far as playback start is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ManifestSummary {
    pub(crate) variants: usize,
    pub(crate) segments: usize,
}

/// Checks that `body` is an HLS playlist and counts what it references.
pub(crate) fn inspect_manifest(body: &str) -> Result<ManifestSummary, String> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err(String::from("no EXTM3U delimiter"));
    }
    let mut summary = ManifestSummary {
        variants: 0,
        segments: 0,
    };
    for line in lines {
        if line.starts_with("#EXT-X-STREAM-INF") {
            summary.variants += 1;
        } else if line.starts_with("#EXTINF") {
            summary.segments += 1;
        }
    }
    Ok(summary)
}

#[instrument(skip_all, fields(%manifest))]
async fn load_manifest(client: reqwest::Client, manifest: Url, events: mpsc::Sender<SessionEvent>) {
    let fatal = |kind, details: String| SessionEvent::Error {
        fatal: true,
        kind,
        details,
    };

    let event = match fetch(&client, &manifest).await {
        Err(details) => fatal(StreamErrorKind::Network, details),
        Ok(body) => match inspect_manifest(&body) {
            Err(why) => fatal(
                StreamErrorKind::Parsing,
                format!("manifestParsingError: {why}"),
            ),
            Ok(summary) => {
                if summary.variants == 0 && summary.segments == 0 {
                    // a live playlist that has not produced its first segment yet
                    let _ = events
                        .send(SessionEvent::Error {
                            fatal: false,
                            kind: StreamErrorKind::Media,
                            details: String::from("levelEmptyError: playlist has no segments"),
                        })
                        .await;
                }
                tracing::debug!(?summary, "manifest parsed");
                SessionEvent::ManifestParsed {
                    variants: summary.variants.max(1),
                }
            }
        },
    };
    // nobody listening means the session was destroyed
    let _ = events.send(event).await;
}

async fn fetch(client: &reqwest::Client, manifest: &Url) -> Result<String, String> {
    let response = client
        .get(manifest.clone())
        .send()
        .await
        .map_err(|e| format!("manifestLoadError: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("manifestLoadError: status {status}"));
    }
    response
        .text()
        .await
        .map_err(|e| format!("manifestLoadError: {e}"))
}
