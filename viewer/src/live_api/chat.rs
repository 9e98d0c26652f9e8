//! WebSocket transport for the room's chat.

use crate::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

/// Opens chat sockets.
pub trait ChatConnector: Send + Sync + 'static {
    type Conn: ChatConnection;

    fn dial(&self, url: &Url) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// One open chat socket.
pub trait ChatConnection: Send + 'static {
    /// Next text frame from the server.
    ///
    /// `None` means the socket is closed. Must be cancel-safe: it is raced against outgoing
    /// frames.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close handshake. Errors are irrelevant at this point and are swallowed.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// [`ChatConnector`] backed by `tokio-tungstenite`.
#[derive(Clone)]
pub struct WsConnector {
    tls: Option<native_tls::TlsConnector>,
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

impl WsConnector {
    pub fn new(insecure: bool) -> Result<Self, native_tls::Error> {
        let tls = if insecure {
            Some(
                native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self { tls })
    }
}

impl ChatConnector for WsConnector {
    type Conn = WsConnection;

    async fn dial(&self, url: &Url) -> Result<WsConnection, TransportError> {
        tracing::debug!(%url, "dialing chat socket");
        let connector = self.tls.clone().map(Connector::NativeTls);
        let (socket, response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            connector,
        )
        .await?;
        tracing::trace!(status = %response.status(), "chat socket upgraded");
        Ok(WsConnection { socket })
    }
}

#[derive(Debug)]
pub struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ChatConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = data.len(), "ignoring non-utf8 binary chat frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "server closed chat socket");
                    return None;
                }
                // pings are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.socket.send(Message::text(frame)).await?;
        Ok(())
    }

    async fn close(mut self) {
        if let Err(e) = self.socket.close(None).await {
            tracing::trace!(error = %e, "error while closing chat socket");
        }
    }
}
