//! Streaming transport
//!
//! A transport opens one socket per connection epoch. Decoded frames go to
//! the shared [`InboundChannel`]; lifecycle changes go to the engine as
//! [`TransportEvent`]s tagged with the epoch so a late report from a dead
//! socket can be told apart from the live one.

use futures_util::{SinkExt, StreamExt};
use terminal_core::{ClientRequest, InboundMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::connection::Endpoint;
use crate::inbound::{InboundChannel, InboundFrame};

/// Capacity of the per-connection outbound request queue
const OUTBOUND_CAPACITY: usize = 256;

/// Lifecycle report from a transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { epoch: u64 },
    Closed { epoch: u64, reason: String },
}

/// Where a transport delivers what it reads
#[derive(Debug, Clone)]
pub struct TransportSink {
    pub epoch: u64,
    pub inbound: InboundChannel,
    pub events: mpsc::Sender<TransportEvent>,
}

impl TransportSink {
    pub async fn opened(&self) {
        let _ = self.events.send(TransportEvent::Opened { epoch: self.epoch }).await;
    }

    pub async fn closed(&self, reason: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                epoch: self.epoch,
                reason: reason.into(),
            })
            .await;
    }

    /// Decode a text frame and queue it, waiting while the queue is full
    pub async fn deliver_text(&self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(message) => {
                self.inbound
                    .push(InboundFrame {
                        epoch: self.epoch,
                        message,
                    })
                    .await
            }
            Err(e) => warn!("[Sync WS] Dropping malformed frame: {}", e),
        }
    }
}

/// The engine's end of one open connection
#[derive(Debug)]
pub struct TransportLink {
    pub epoch: u64,
    outbound: mpsc::Sender<ClientRequest>,
}

impl TransportLink {
    pub fn new(epoch: u64, outbound: mpsc::Sender<ClientRequest>) -> Self {
        Self { epoch, outbound }
    }

    /// Queue a request for the socket; false when it could not be queued
    pub fn send(&self, request: ClientRequest) -> bool {
        match self.outbound.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Sync WS] Outbound request dropped (epoch {}): {}", self.epoch, e);
                false
            }
        }
    }

    /// Ask the task to close the socket
    ///
    /// Dropping the sender ends the write side; the task sends a close frame.
    pub fn close(self) {
        drop(self.outbound);
    }
}

/// Opens streaming connections
pub trait Transport: Send + Sync + 'static {
    fn open(&self, endpoint: Endpoint, sink: TransportSink) -> TransportLink;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(&self, endpoint: Endpoint, sink: TransportSink) -> TransportLink {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let epoch = sink.epoch;
        tokio::spawn(async move {
            let reason = match connection_task(endpoint, &sink, outbound_rx).await {
                Ok(reason) => reason,
                Err(e) => {
                    error!("[Sync WS] Connection failed (epoch {}): {}", sink.epoch, e);
                    e.to_string()
                }
            };
            sink.closed(reason).await;
        });
        TransportLink::new(epoch, outbound_tx)
    }
}

/// Run one socket until it closes; returns why it closed
async fn connection_task(
    endpoint: Endpoint,
    sink: &TransportSink,
    mut outbound: mpsc::Receiver<ClientRequest>,
) -> anyhow::Result<String> {
    let mut request = endpoint.url.as_str().into_client_request()?;
    if let Some(key) = &endpoint.credentials.api_key {
        request
            .headers_mut()
            .insert("X-API-Key", HeaderValue::from_str(key)?);
    }

    // The engine abandons a hung connect by dropping the link
    let connect = connect_async(request);
    tokio::pin!(connect);
    let (ws_stream, _) = loop {
        tokio::select! {
            result = &mut connect => break result?,
            request = outbound.recv() => {
                if request.is_none() {
                    debug!("[Sync WS] Connect abandoned (epoch {})", sink.epoch);
                    return Ok("connect abandoned".to_string());
                }
            }
        }
    };
    info!("[Sync WS] Socket open (epoch {})", sink.epoch);
    sink.opened().await;

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        sink.deliver_text(&text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        info!("[Sync WS] Server closed the connection: {}", reason);
                        return Ok(reason);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("[Sync WS] Ignoring binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok("stream ended".to_string()),
                }
            }

            request = outbound.recv() => {
                match request {
                    Some(request) => {
                        let json = serde_json::to_string(&request)?;
                        write.send(Message::Text(json.into())).await?;
                    }
                    None => {
                        debug!("[Sync WS] Closing socket (epoch {})", sink.epoch);
                        let _ = write.send(Message::Close(None)).await;
                        return Ok("closed locally".to_string());
                    }
                }
            }
        }
    }
}
