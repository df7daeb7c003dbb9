use casefeed_core::wire::PING_FRAME;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Something the session read that matters to the manager: a text frame to
/// decode, or a bare liveness signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
}

/// Opens sessions to the timeline stream. Injected into the connection
/// manager so tests can script the server side.
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

pub trait Session: Send + 'static {
    /// Next inbound frame; `None` once the peer has closed. Must be cancel
    /// safe, the manager races it against timers.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Inbound, TransportError>>> + Send;

    fn send_ping(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WsTransport {
    type Session = WsSession;

    async fn connect(&self) -> Result<WsSession, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(
            event = "ws_handshake",
            url = %self.url,
            status = %response.status()
        );
        Ok(WsSession { stream })
    }
}

pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Session for WsSession {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(TransportError::Receive(err.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Inbound::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Inbound::Text(text))),
                    Err(_) => {
                        debug!(event = "ws_binary_ignored");
                        continue;
                    }
                },
                Message::Ping(_) | Message::Pong(_) => return Some(Ok(Inbound::Pong)),
                Message::Close(_) => return None,
                Message::Frame(_) => continue,
            }
        }
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(PING_FRAME.to_string()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
