//! Stream actor and its handles.
//!
//! One tokio task owns the [`Connection`] and serially handles commands,
//! transport events and timer firings from a single queue. The task publishes
//! the connection snapshot and the latest raw payload on `watch` channels.
//! Every status transition and every raw frame, in arrival order, go out on
//! `broadcast` channels.

use crate::machine::{ConnStatus, Connection, Effect, Event, Policy, StreamError};
use crate::timer::{Scheduler, TokioScheduler};
use crate::transport::{Connector, WsConnector};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// Point-in-time view of the link, published after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnSnapshot {
    /// Current status.
    pub status: ConnStatus,
    /// Last recorded error.
    pub error: Option<StreamError>,
    /// Automatic reconnect attempts since the last successful open.
    pub attempts: u32,
    /// Endpoint URL.
    pub url: String,
}

impl ConnSnapshot {
    fn of(conn: &Connection) -> Self {
        Self {
            status: conn.status(),
            error: conn.last_error().cloned(),
            attempts: conn.attempts(),
            url: conn.url().to_string(),
        }
    }
}

/// Returned when a command is sent after the actor has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream client has shut down")]
pub struct ClientClosed;

/// Applies machine effects to a scheduler and connector and publishes state.
pub struct Actor<S, C> {
    conn: Connection,
    scheduler: S,
    connector: C,
    snapshot_tx: watch::Sender<ConnSnapshot>,
    payload_tx: watch::Sender<Option<String>>,
    frame_tx: broadcast::Sender<String>,
    status_tx: broadcast::Sender<ConnStatus>,
}

impl<S: Scheduler, C: Connector> Actor<S, C> {
    /// Wraps `conn`, returning the actor and a handle sharing its channels.
    pub fn new(
        conn: Connection,
        scheduler: S,
        connector: C,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Self, StreamHandle) {
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnSnapshot::of(&conn));
        let (payload_tx, payload_rx) = watch::channel(conn.latest_payload().map(String::from));
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let handle = StreamHandle {
            events,
            snapshot_rx,
            payload_rx,
            frame_tx: frame_tx.clone(),
            status_tx: status_tx.clone(),
        };
        let actor = Self {
            conn,
            scheduler,
            connector,
            snapshot_tx,
            payload_tx,
            frame_tx,
            status_tx,
        };
        (actor, handle)
    }

    /// Read access to the machine state.
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access to the scheduler, for driving a virtual clock.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Read access to the connector.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Mutable access to the connector.
    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// Handles one event. Returns `false` once the actor has been torn down.
    pub fn step(&mut self, event: Event) -> bool {
        for effect in self.conn.handle(event) {
            self.apply(effect);
        }
        self.snapshot_tx.send_if_modified(|snap| {
            let next = ConnSnapshot::of(&self.conn);
            if *snap == next {
                false
            } else {
                *snap = next;
                true
            }
        });
        !self.conn.is_torn_down()
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Open { id, url } => self.connector.open(id, url),
            Effect::Close { id, code, reason } => self.connector.close(id, code, reason),
            Effect::Abort(id) => self.connector.abort(id),
            Effect::Schedule { id, kind, delay } => {
                debug!(timer = id.0, ?kind, ?delay, "arming timer");
                self.scheduler.schedule(id, delay);
            }
            Effect::Cancel(id) => self.scheduler.cancel(id),
            Effect::Status(status) => {
                let _ = self.status_tx.send(status);
            }
            Effect::Payload(raw) => {
                let _ = self.frame_tx.send(raw.clone());
                self.payload_tx.send_replace(Some(raw));
            }
        }
    }

    /// Drains `events` until teardown or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if !self.step(event) {
                break;
            }
        }
        if !self.conn.is_torn_down() {
            self.step(Event::Teardown);
        }
        info!("stream actor stopped");
    }
}

/// Cloneable control and observation handle for a running stream actor.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    events: mpsc::UnboundedSender<Event>,
    snapshot_rx: watch::Receiver<ConnSnapshot>,
    payload_rx: watch::Receiver<Option<String>>,
    frame_tx: broadcast::Sender<String>,
    status_tx: broadcast::Sender<ConnStatus>,
}

impl StreamHandle {
    fn send(&self, event: Event) -> Result<(), ClientClosed> {
        self.events.send(event).map_err(|_| ClientClosed)
    }

    /// Opens the link if it is not already opening or open.
    ///
    /// # Errors
    ///
    /// Returns [`ClientClosed`] if the actor has stopped.
    pub fn connect(&self) -> Result<(), ClientClosed> {
        self.send(Event::Connect)
    }

    /// Closes the link and stops automatic reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientClosed`] if the actor has stopped.
    pub fn disconnect(&self) -> Result<(), ClientClosed> {
        self.send(Event::Disconnect)
    }

    /// Resets the attempt budget, disconnects and reconnects shortly after.
    ///
    /// # Errors
    ///
    /// Returns [`ClientClosed`] if the actor has stopped.
    pub fn force_reconnect(&self) -> Result<(), ClientClosed> {
        self.send(Event::ForceReconnect)
    }

    /// Switches to a new endpoint URL and connects to it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientClosed`] if the actor has stopped.
    pub fn set_url(&self, url: impl Into<String>) -> Result<(), ClientClosed> {
        self.send(Event::SetUrl(url.into()))
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Latest non-empty raw payload.
    #[must_use]
    pub fn latest_payload(&self) -> Option<String> {
        self.payload_rx.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<ConnSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Receiver that observes the newest raw payload.
    ///
    /// Intermediate payloads may be skipped; use
    /// [`subscribe_frames`](Self::subscribe_frames) to see every frame.
    #[must_use]
    pub fn watch_payload(&self) -> watch::Receiver<Option<String>> {
        self.payload_rx.clone()
    }

    /// Receiver for every raw frame from now on, in arrival order.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<String> {
        self.frame_tx.subscribe()
    }

    /// Receiver for every status transition, including intermediate ones.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }
}

/// Owns a spawned stream actor. Dropping it tears the actor down.
pub struct StreamClient {
    handle: StreamHandle,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Spawns an idle actor for `url` using the WebSocket connector.
    ///
    /// The link stays disconnected until [`StreamHandle::connect`] is called.
    #[must_use]
    pub fn spawn(url: impl Into<String>, policy: Policy) -> Self {
        Self::spawn_with(url, policy, WsConnector::new)
    }

    /// Spawns an idle actor with a custom connector built from the event sender.
    pub fn spawn_with<C, F>(url: impl Into<String>, policy: Policy, make_connector: F) -> Self
    where
        C: Connector + 'static,
        F: FnOnce(mpsc::UnboundedSender<Event>) -> C,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(url, policy);
        let scheduler = TokioScheduler::new(tx.clone());
        let connector = make_connector(tx.clone());
        let (actor, handle) = Actor::new(conn, scheduler, connector, tx);
        let task = tokio::spawn(actor.run(rx));
        Self {
            handle,
            task: Some(task),
        }
    }

    /// A new handle to the actor.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Tears the actor down and waits for it to stop.
    pub async fn shutdown(mut self) {
        let _ = self.handle.send(Event::Teardown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.handle.send(Event::Teardown);
        }
    }
}
