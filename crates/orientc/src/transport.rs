use crate::machine::{Event, TransportId};
use futures_util::{SinkExt, StreamExt};
use orient_common::types::close_code;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, trace, warn};

/// How long to wait for the peer's close reply after we send a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens and tears down WebSocket transports on behalf of the stream actor.
///
/// Implementations report progress asynchronously as [`Event::Opened`],
/// [`Event::Message`], [`Event::TransportFailed`] and [`Event::Closed`], all
/// tagged with the id passed to [`Connector::open`].
pub trait Connector: Send {
    /// Starts opening a transport to `url`.
    fn open(&mut self, id: TransportId, url: String);
    /// Sends a close frame and lets the transport wind down.
    fn close(&mut self, id: TransportId, code: u16, reason: String);
    /// Drops the transport immediately.
    fn abort(&mut self, id: TransportId);
}

/// Errors raised inside a transport task.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP, TLS or WebSocket handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    /// Reading from an open socket failed.
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),
}

struct Link {
    close_tx: Option<oneshot::Sender<(u16, String)>>,
    task: JoinHandle<()>,
}

/// [`Connector`] backed by `tokio-tungstenite`, one task per transport.
pub struct WsConnector {
    events: mpsc::UnboundedSender<Event>,
    links: HashMap<TransportId, Link>,
}

impl WsConnector {
    /// Creates a connector that posts transport events to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            links: HashMap::new(),
        }
    }
}

impl Connector for WsConnector {
    fn open(&mut self, id: TransportId, url: String) {
        self.links.retain(|_, link| !link.task.is_finished());
        let (close_tx, close_rx) = oneshot::channel();
        let events = self.events.clone();
        let task = tokio::spawn(run_link(id, url, events, close_rx));
        self.links.insert(
            id,
            Link {
                close_tx: Some(close_tx),
                task,
            },
        );
    }

    fn close(&mut self, id: TransportId, code: u16, reason: String) {
        if let Some(mut link) = self.links.remove(&id) {
            if let Some(tx) = link.close_tx.take() {
                let _ = tx.send((code, reason));
            }
        }
    }

    fn abort(&mut self, id: TransportId) {
        if let Some(link) = self.links.remove(&id) {
            link.task.abort();
        }
    }
}

impl Drop for WsConnector {
    fn drop(&mut self) {
        for (_, link) in self.links.drain() {
            link.task.abort();
        }
    }
}

async fn run_link(
    id: TransportId,
    url: String,
    events: mpsc::UnboundedSender<Event>,
    mut close_rx: oneshot::Receiver<(u16, String)>,
) {
    debug!(transport = id.0, url = %url, "opening transport");
    let connected = tokio::select! {
        res = tokio_tungstenite::connect_async(url.as_str()) => res.map_err(TransportError::Handshake),
        _ = &mut close_rx => {
            debug!(transport = id.0, "closed before handshake completed");
            return;
        }
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(transport = id.0, error = %e, "transport failed to open");
            let _ = events.send(Event::TransportFailed(id));
            let _ = events.send(Event::Closed {
                id,
                code: close_code::ABNORMAL,
                reason: String::new(),
                was_clean: false,
            });
            return;
        }
    };
    let _ = events.send(Event::Opened(id));

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut peer_close: Option<(u16, String)> = None;
    let mut close_armed = true;

    let outcome = loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(Event::Message(id, text));
                }
                Some(Ok(Message::Close(frame))) => {
                    peer_close = Some(frame.map_or_else(
                        || (close_code::NO_STATUS, String::new()),
                        |f| (u16::from(f.code), f.reason.into_owned()),
                    ));
                }
                Some(Ok(other)) => {
                    trace!(transport = id.0, kind = message_kind(&other), "ignoring frame");
                }
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => break Ok(()),
                Some(Err(e)) => break Err(TransportError::Read(e)),
            },
            req = &mut close_rx, if close_armed && peer_close.is_none() => {
                close_armed = false;
                let Ok((code, reason)) = req else { continue };
                info!(transport = id.0, code, reason = %reason, "closing transport");
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.clone().into(),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    while let Some(Ok(_)) = ws_rx.next().await {}
                })
                .await;
                peer_close = Some((code, reason));
                break Ok(());
            }
        }
    };

    let event = match (outcome, peer_close) {
        (Ok(()), Some((code, reason))) => Event::Closed {
            id,
            code,
            reason,
            was_clean: true,
        },
        (Ok(()), None) => Event::Closed {
            id,
            code: close_code::ABNORMAL,
            reason: String::new(),
            was_clean: false,
        },
        (Err(e), _) => {
            warn!(transport = id.0, error = %e, "transport dropped");
            Event::Closed {
                id,
                code: close_code::ABNORMAL,
                reason: String::new(),
                was_clean: false,
            }
        }
    };
    let _ = events.send(event);
}

const fn message_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}
