//! Connection lifecycle state machine.
//!
//! [`Connection`] owns every piece of mutable link state and is driven one
//! [`Event`] at a time. Each call to [`Connection::handle`] returns the
//! [`Effect`]s the caller must perform (open or close a transport, arm or
//! cancel a timer, hand a payload to the decoder). Nothing here touches a
//! socket or a clock, so the whole lifecycle is testable without a network.
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnected (clean 1000 close)
//!                     |             |------> reconnecting -> connecting
//!                     |             '------> error (attempts exhausted)
//!                     '--> error (bad URL, timeout, transport failure)
//! ```

use crate::backoff::ExponentialBackoff;
use orient_common::types::close_code;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identifies one underlying transport. Events from a superseded id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

/// Identifies one armed single-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Purpose of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Abort the transport if it has not opened in time.
    ConnectTimeout,
    /// Start the next automatic reconnect attempt.
    Reconnect,
    /// Re-connect after an operator-requested forced reconnect.
    ForceReconnect,
}

/// Connection status of the relay WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnStatus {
    /// Idle: initial state, after a manual disconnect or a clean close.
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// The transport is open and frames are flowing.
    Connected,
    /// Waiting for the backoff delay before the next attempt.
    Reconnecting,
    /// Stopped on an error; needs an explicit connect or retry.
    Error,
}

impl ConnStatus {
    /// Lowercase wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing description of the last connection problem.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StreamError {
    /// Human-readable message.
    pub message: String,
    /// WebSocket close code, when the error came from a close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Close reason sent by the peer, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StreamError {
    /// An error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            reason: None,
        }
    }

    fn from_close(message: &str, code: u16, reason: &str) -> Self {
        Self {
            message: message.to_string(),
            code: Some(code),
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        }
    }
}

pub(crate) const INVALID_URL: &str = "Invalid WebSocket URL format";
pub(crate) const CONNECT_TIMEOUT: &str = "Connection timeout - server may be offline";
pub(crate) const MAX_ATTEMPTS: &str = "Max reconnection attempts reached";
pub(crate) const MANUAL_DISCONNECT: &str = "Manual disconnect";

/// Maps an unexpected close to the message shown to the operator.
#[must_use]
pub fn classify_close(code: u16, was_clean: bool) -> &'static str {
    match code {
        close_code::ABNORMAL => "Server unreachable - check if relay server is running",
        close_code::PROTOCOL_ERROR => "Protocol error",
        close_code::UNSUPPORTED_DATA => "Unsupported data",
        _ if !was_clean => "Connection interrupted",
        _ => "Connection lost",
    }
}

/// Message recorded for a transport-level error event on `url`.
#[must_use]
pub fn transport_failure_message(url: &str) -> &'static str {
    if url.contains("localhost") || url.contains("127.0.0.1") {
        "Cannot connect to localhost - make sure the relay server is running"
    } else {
        "Cannot connect to server - check network and server status"
    }
}

/// Returns `true` if `url` uses a WebSocket scheme.
#[must_use]
pub fn is_websocket_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// Reconnect and timeout parameters.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Delay schedule between automatic reconnect attempts.
    pub backoff: ExponentialBackoff,
    /// Automatic reconnect budget before giving up.
    pub max_attempts: u32,
    /// How long a transport may stay in the opening phase.
    pub connect_timeout: Duration,
    /// Pause between the disconnect and connect halves of a forced reconnect.
    pub force_reconnect_delay: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                Duration::from_millis(1000),
                Duration::from_millis(30_000),
                2.0,
            ),
            max_attempts: 10,
            connect_timeout: Duration::from_millis(5000),
            force_reconnect_delay: Duration::from_millis(100),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Operator or startup request to connect.
    Connect,
    /// Operator request to disconnect.
    Disconnect,
    /// Operator request to reset the attempt budget and reconnect.
    ForceReconnect,
    /// Replace the endpoint URL and reconnect to it.
    SetUrl(String),
    /// Owner is shutting down; no further effects will be produced.
    Teardown,
    /// The transport finished its opening handshake.
    Opened(TransportId),
    /// A text frame arrived on the transport.
    Message(TransportId, String),
    /// The transport closed.
    Closed {
        /// Transport that closed.
        id: TransportId,
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
        /// Whether a closing handshake completed.
        was_clean: bool,
    },
    /// The transport reported an error; a close usually follows.
    TransportFailed(TransportId),
    /// A previously armed timer elapsed.
    TimerFired(TimerId),
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport to `url`.
    Open {
        /// Id the transport must tag its events with.
        id: TransportId,
        /// Endpoint to connect to.
        url: String,
    },
    /// Close a transport with a close frame.
    Close {
        /// Transport to close.
        id: TransportId,
        /// Close code to send.
        code: u16,
        /// Close reason to send.
        reason: String,
    },
    /// Drop a transport without a closing handshake.
    Abort(TransportId),
    /// Arm a single-shot timer.
    Schedule {
        /// Id to report in [`Event::TimerFired`].
        id: TimerId,
        /// What the timer is for.
        kind: TimerKind,
        /// Delay before it fires.
        delay: Duration,
    },
    /// Cancel an armed timer.
    Cancel(TimerId),
    /// The status changed to this value.
    Status(ConnStatus),
    /// A non-empty payload became the latest raw frame.
    Payload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Opening(TransportId),
    Open(TransportId),
}

impl Slot {
    const fn id(self) -> Option<TransportId> {
        match self {
            Self::Idle => None,
            Self::Opening(id) | Self::Open(id) => Some(id),
        }
    }
}

/// The single logical link to the relay endpoint.
#[derive(Debug)]
pub struct Connection {
    url: String,
    policy: Policy,
    status: ConnStatus,
    last_error: Option<StreamError>,
    latest_payload: Option<String>,
    attempts: u32,
    manual_disconnect: bool,
    torn_down: bool,
    slot: Slot,
    connect_timer: Option<TimerId>,
    reconnect_timer: Option<TimerId>,
    force_timer: Option<TimerId>,
    next_transport: u64,
    next_timer: u64,
}

impl Connection {
    /// Creates a disconnected connection targeting `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, policy: Policy) -> Self {
        Self {
            url: url.into(),
            policy,
            status: ConnStatus::Disconnected,
            last_error: None,
            latest_payload: None,
            attempts: 0,
            manual_disconnect: false,
            torn_down: false,
            slot: Slot::Idle,
            connect_timer: None,
            reconnect_timer: None,
            force_timer: None,
            next_transport: 0,
            next_timer: 0,
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ConnStatus {
        self.status
    }

    /// Last recorded error, cleared on successful open and on disconnect.
    #[must_use]
    pub const fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Latest non-empty raw payload.
    #[must_use]
    pub fn latest_payload(&self) -> Option<&str> {
        self.latest_payload.as_deref()
    }

    /// Automatic reconnect attempts made since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the last stop was requested by the operator.
    #[must_use]
    pub const fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect
    }

    /// Whether a transport is opening or open.
    #[must_use]
    pub const fn has_transport(&self) -> bool {
        !matches!(self.slot, Slot::Idle)
    }

    /// Whether [`Event::Teardown`] has been handled.
    #[must_use]
    pub const fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Ids of timers currently armed.
    #[must_use]
    pub fn pending_timers(&self) -> Vec<TimerId> {
        [self.connect_timer, self.reconnect_timer, self.force_timer]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Applies one event and returns the effects to perform, in order.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.torn_down {
            debug!(?event, "ignoring event after teardown");
            return fx;
        }
        match event {
            Event::Connect => self.connect(&mut fx),
            Event::Disconnect => self.disconnect(&mut fx),
            Event::ForceReconnect => self.force_reconnect(&mut fx),
            Event::SetUrl(url) => {
                self.disconnect(&mut fx);
                info!(url = %url, "endpoint changed");
                self.url = url;
                self.connect(&mut fx);
            }
            Event::Teardown => {
                self.manual_disconnect = true;
                self.disconnect(&mut fx);
                self.torn_down = true;
            }
            Event::Opened(id) => self.on_open(id, &mut fx),
            Event::Message(id, text) => self.on_message(id, text, &mut fx),
            Event::Closed {
                id,
                code,
                reason,
                was_clean,
            } => self.on_close(id, code, &reason, was_clean, &mut fx),
            Event::TransportFailed(id) => self.on_transport_error(id, &mut fx),
            Event::TimerFired(id) => self.on_timer(id, &mut fx),
        }
        fx
    }

    fn set_status(&mut self, status: ConnStatus, fx: &mut Vec<Effect>) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "status change");
            self.status = status;
            fx.push(Effect::Status(status));
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, fx: &mut Vec<Effect>) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        fx.push(Effect::Schedule { id, kind, delay });
        id
    }

    fn cancel(timer: &mut Option<TimerId>, fx: &mut Vec<Effect>) {
        if let Some(id) = timer.take() {
            fx.push(Effect::Cancel(id));
        }
    }

    fn connect(&mut self, fx: &mut Vec<Effect>) {
        if self.has_transport() {
            debug!("connect ignored: transport already opening or open");
            return;
        }
        Self::cancel(&mut self.reconnect_timer, fx);
        Self::cancel(&mut self.force_timer, fx);

        self.last_error = None;
        self.set_status(ConnStatus::Connecting, fx);
        self.manual_disconnect = false;

        if !is_websocket_url(&self.url) {
            warn!(url = %self.url, "refusing to connect: not a ws:// or wss:// URL");
            self.last_error = Some(StreamError::new(INVALID_URL));
            self.set_status(ConnStatus::Error, fx);
            return;
        }

        self.next_transport += 1;
        let id = TransportId(self.next_transport);
        self.slot = Slot::Opening(id);
        fx.push(Effect::Open {
            id,
            url: self.url.clone(),
        });
        self.connect_timer =
            Some(self.arm(TimerKind::ConnectTimeout, self.policy.connect_timeout, fx));
    }

    fn disconnect(&mut self, fx: &mut Vec<Effect>) {
        self.manual_disconnect = true;
        Self::cancel(&mut self.connect_timer, fx);
        Self::cancel(&mut self.reconnect_timer, fx);
        Self::cancel(&mut self.force_timer, fx);

        if let Some(id) = self.slot.id() {
            fx.push(Effect::Close {
                id,
                code: close_code::NORMAL,
                reason: MANUAL_DISCONNECT.to_string(),
            });
        }
        self.slot = Slot::Idle;

        self.set_status(ConnStatus::Disconnected, fx);
        self.last_error = None;
        self.attempts = 0;
    }

    fn force_reconnect(&mut self, fx: &mut Vec<Effect>) {
        info!("forced reconnect requested");
        self.attempts = 0;
        self.disconnect(fx);
        self.force_timer = Some(self.arm(
            TimerKind::ForceReconnect,
            self.policy.force_reconnect_delay,
            fx,
        ));
    }

    fn on_open(&mut self, id: TransportId, fx: &mut Vec<Effect>) {
        if self.slot != Slot::Opening(id) {
            debug!(transport = id.0, "ignoring open from stale transport");
            return;
        }
        Self::cancel(&mut self.connect_timer, fx);
        self.slot = Slot::Open(id);
        self.last_error = None;
        self.attempts = 0;
        self.set_status(ConnStatus::Connected, fx);
        info!(url = %self.url, "connected to relay");
    }

    fn on_message(&mut self, id: TransportId, text: String, fx: &mut Vec<Effect>) {
        if self.slot.id() != Some(id) {
            return;
        }
        if text.is_empty() {
            return;
        }
        self.latest_payload = Some(text.clone());
        fx.push(Effect::Payload(text));
    }

    fn on_close(
        &mut self,
        id: TransportId,
        code: u16,
        reason: &str,
        was_clean: bool,
        fx: &mut Vec<Effect>,
    ) {
        if self.slot.id() != Some(id) {
            debug!(transport = id.0, code, "ignoring close from stale transport");
            return;
        }
        Self::cancel(&mut self.connect_timer, fx);
        self.slot = Slot::Idle;
        info!(code, reason, was_clean, "relay connection closed");

        if self.manual_disconnect {
            self.set_status(ConnStatus::Disconnected, fx);
            return;
        }

        if code == close_code::NORMAL && was_clean {
            self.last_error = None;
            self.set_status(ConnStatus::Disconnected, fx);
            return;
        }

        let message = classify_close(code, was_clean);
        warn!(code, message, "relay connection lost");
        self.last_error = Some(StreamError::from_close(message, code, reason));
        self.set_status(ConnStatus::Disconnected, fx);

        if self.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff.delay(self.attempts);
            self.reconnect_timer = Some(self.arm(TimerKind::Reconnect, delay, fx));
            self.attempts += 1;
            self.set_status(ConnStatus::Reconnecting, fx);
            info!(
                attempt = self.attempts,
                max = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnect scheduled"
            );
        } else {
            warn!(max = self.policy.max_attempts, "giving up on relay");
            self.last_error = Some(StreamError::new(MAX_ATTEMPTS));
            self.set_status(ConnStatus::Error, fx);
        }
    }

    fn on_transport_error(&mut self, id: TransportId, fx: &mut Vec<Effect>) {
        if self.slot.id() != Some(id) {
            return;
        }
        Self::cancel(&mut self.connect_timer, fx);
        let message = transport_failure_message(&self.url);
        warn!(url = %self.url, message, "transport error");
        self.last_error = Some(StreamError::new(message));
        self.set_status(ConnStatus::Error, fx);
    }

    fn on_timer(&mut self, id: TimerId, fx: &mut Vec<Effect>) {
        if self.connect_timer == Some(id) {
            self.connect_timer = None;
            if let Slot::Opening(transport) = self.slot {
                if self.status == ConnStatus::Connecting {
                    warn!(url = %self.url, "connection timeout");
                    fx.push(Effect::Abort(transport));
                    self.slot = Slot::Idle;
                    self.last_error = Some(StreamError::new(CONNECT_TIMEOUT));
                    self.set_status(ConnStatus::Error, fx);
                }
            }
        } else if self.reconnect_timer == Some(id) {
            self.reconnect_timer = None;
            info!(
                attempt = self.attempts,
                max = self.policy.max_attempts,
                "reconnection attempt"
            );
            self.connect(fx);
        } else if self.force_timer == Some(id) {
            self.force_timer = None;
            self.connect(fx);
        } else {
            debug!(timer = id.0, "ignoring stale timer");
        }
    }
}
