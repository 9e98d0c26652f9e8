//! HTTP client for the origin's status endpoint.

use crate::config::Config;
use crate::error::TransportError;
use crate::live_api::types::StreamStatus;
use reqwest::{StatusCode, Url};
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// Anything that can answer "what is the status of this room right now".
///
/// The poller is generic over this so it can be driven without a server.
pub trait StatusSource: Send + Sync + 'static {
    fn fetch_status(&self) -> impl Future<Output = Result<StreamStatus, TransportError>> + Send;
}

/// Client for `GET {origin}/isLive?room={room}`.
#[derive(Debug, Clone)]
pub struct LiveClient {
    /// HTTP client for API requests, shared with the manifest loader
    client: reqwest::Client,
    status_url: Url,
    room: String,
}

impl LiveClient {
    pub fn new(client: reqwest::Client, config: &Config) -> Result<Self, TransportError> {
        Ok(Self {
            client,
            status_url: config.status_url()?,
            room: config.room.clone(),
        })
    }

    /// Builds the shared HTTP client.
    ///
    /// `insecure` disables certificate verification, which the stock deployment needs since
    /// it serves a self-signed certificate for `localhost`.
    pub fn http_client(insecure: bool) -> Result<reqwest::Client, TransportError> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|source| TransportError::Request {
                url: String::from("<client builder>"),
                source,
            })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Queries the current status of the room.
    ///
    /// Succeeds only on a 2xx response carrying a JSON stream record. The server answers
    /// `204 No Content` for rooms it does not know, which is reported as
    /// [`TransportError::UnknownRoom`].
    #[instrument(skip(self), fields(room = %self.room), level = tracing::Level::TRACE)]
    pub async fn poll(&self) -> Result<StreamStatus, TransportError> {
        let url = self.status_url.as_str();
        let response = self
            .client
            .get(self.status_url.clone())
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Err(TransportError::UnknownRoom {
                room: self.room.clone(),
            });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }

        response
            .json::<StreamStatus>()
            .await
            .map_err(|source| TransportError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

impl StatusSource for LiveClient {
    fn fetch_status(&self) -> impl Future<Output = Result<StreamStatus, TransportError>> + Send {
        self.poll()
    }
}
