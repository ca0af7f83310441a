//! Connector seam and the websocket transport worker.
//!
//! A connector opens one physical link and hands back a pair of WAMP message
//! channels. The link performs a single connection attempt; retrying is the
//! connection handle's job.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::realtime::proto::{ProtoError, WampMessage, WAMP_SUBPROTOCOL};

/// Router address and realm of one physical connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub url: String,
    pub realm: String,
}

/// Message channels of an open link.
///
/// Dropping `outbound` closes the link; `inbound` yields `None` once the
/// link is gone.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<WampMessage>,
    pub inbound: mpsc::UnboundedReceiver<WampMessage>,
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send>>;

/// Opens physical links to a router.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> ConnectFuture;
}

/// Errors produced while opening or running a link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Frame could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Router broke the WAMP contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ProtoError> for TransportError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Json(err) => Self::Json(err),
            ProtoError::Malformed(reason) => Self::Protocol(reason),
            ProtoError::Unsupported(kind) => {
                Self::Protocol(format!("unsupported wamp message type {kind}"))
            }
        }
    }
}

/// Production connector speaking JSON-serialized WAMP over a websocket.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, params: &ConnectParams) -> ConnectFuture {
        let url = params.url.clone();
        Box::pin(async move { open_websocket_link(&url).await })
    }
}

async fn open_websocket_link(url: &str) -> Result<Link, TransportError> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(WAMP_SUBPROTOCOL),
    );

    let (socket, _) = connect_async(request).await?;
    debug!(event = "realtime_socket_open", url = %url);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(link_worker(socket, outbound_rx, inbound_tx));

    Ok(Link {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

async fn link_worker<S>(
    mut socket: tokio_tungstenite::WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<WampMessage>,
    inbound_tx: mpsc::UnboundedSender<WampMessage>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(message) => {
                        if let Err(err) = send_wamp_message(&mut socket, &message).await {
                            warn!(event = "realtime_socket_send_failed", error = %err);
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match WampMessage::from_text(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                let _ = socket.close(None).await;
                                break;
                            }
                        }
                        Err(ProtoError::Unsupported(kind)) => {
                            debug!(event = "realtime_frame_ignored", message_type = kind);
                        }
                        Err(err) => {
                            warn!(event = "realtime_frame_rejected", error = %err);
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "realtime_socket_closed_by_peer", frame = ?frame);
                        break;
                    }
                    Some(Ok(_)) => {
                        warn!(event = "realtime_frame_rejected", error = "non-text frame");
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(event = "realtime_socket_error", error = %err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn send_wamp_message<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    message: &WampMessage,
) -> Result<(), TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}
