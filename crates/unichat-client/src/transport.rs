//! WebSocket transport to the hub.
//!
//! Provides [`WebSocketConnector`], a [`HubConnector`] over
//! `tokio-tungstenite`. This is a thin layer that only moves text records;
//! handshake, keep-alive and invocation logic stay in the core
//! [`HubConnection`](unichat_core::HubConnection).

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, trace, warn};
use unichat_core::{Credential, TransportFailure};

use crate::connector::{DEFAULT_LINK_CAPACITY, HubConnector, HubLink, hub_url};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Hub refused the upgrade with 401 or 403.
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),

    /// Hub refused the upgrade with another status.
    #[error("upgrade refused (HTTP {0})")]
    Refused(u16),

    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Hub closed the socket.
    #[error("closed by hub: {0}")]
    Closed(String),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => match response.status().as_u16() {
                code @ (401 | 403) => Self::Unauthorized(code),
                code => Self::Refused(code),
            },
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed("connection closed".into())
            },
            err => Self::Connection(err.to_string()),
        }
    }
}

impl From<TransportError> for TransportFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(_) => Self::Unauthorized,
            err => Self::Network(err.to_string()),
        }
    }
}

/// Connects to the hub over WebSocket, passing the credential as the
/// `access_token` query parameter.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    capacity: usize,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    /// Connector with default channel capacity.
    pub fn new() -> Self {
        Self { capacity: DEFAULT_LINK_CAPACITY }
    }

    /// Connector whose link channels hold `capacity` records.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl HubConnector for WebSocketConnector {
    async fn connect(&self, url: &str, credential: &Credential) -> Result<HubLink, TransportFailure> {
        let (socket, response) = connect_async(hub_url(url, credential)).await.map_err(TransportError::from)?;
        debug!(url, status = response.status().as_u16(), "websocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(run_socket(socket, outgoing_rx, incoming_tx));

        Ok(HubLink::new(outgoing_tx, incoming_rx).with_abort(handle.abort_handle()))
    }
}

/// Bridge between the link channels and the socket until either side ends.
async fn run_socket(
    socket: Socket,
    mut outgoing: mpsc::Receiver<String>,
    incoming: mpsc::Sender<Result<String, TransportFailure>>,
) {
    let (mut write, mut read) = socket.split();

    let ended = loop {
        tokio::select! {
            text = outgoing.recv() => {
                let Some(text) = text else {
                    // Link dropped
                    let _ = write.close().await;
                    return;
                };
                trace!(len = text.len(), "ws send");
                if let Err(err) = write.send(Message::Text(text.into())).await {
                    break TransportError::from(err);
                }
            },

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if incoming.send(Ok(text.as_str().to_owned())).await.is_err() {
                        return;
                    }
                },
                Some(Ok(Message::Binary(data))) => warn!(len = data.len(), "binary message ignored"),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|frame| frame.reason.as_str().to_owned()).unwrap_or_default();
                    break TransportError::Closed(reason);
                },
                // Ping, pong and raw frames are handled by tungstenite
                Some(Ok(_)) => {},
                Some(Err(err)) => break TransportError::from(err),
                None => break TransportError::Closed("stream ended".into()),
            },
        }
    };

    debug!(%ended, "websocket ended");
    let _ = incoming.send(Err(ended.into())).await;
}
