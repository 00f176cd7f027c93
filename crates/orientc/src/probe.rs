use orient_common::types::{ORIENTATION_PATH, STATUS_PATH};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client-side timeout for the status request.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of the relay's HTTP status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    /// Number of clients currently attached to the relay.
    pub clients_connected: u64,
}

/// Why a status probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The stream URL is not `ws://` or `wss://`.
    #[error("Invalid WebSocket URL format")]
    InvalidUrl,
    /// No response within the probe timeout.
    #[error("Connection timeout - server may be offline")]
    Timeout,
    /// The TCP connection or request could not be made.
    #[error("Cannot reach server - check if relay server is running")]
    Unreachable(#[source] reqwest::Error),
    /// The relay answered with a non-2xx status.
    #[error("Server responded with status {0}")]
    Status(u16),
    /// The response body was not a status document.
    #[error("unexpected status response: {0}")]
    Body(#[source] reqwest::Error),
}

impl ProbeError {
    fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Unreachable(e)
        }
    }
}

/// Derives the HTTP status endpoint from a stream URL.
///
/// ```
/// use orientc::probe::status_url;
/// assert_eq!(
///     status_url("ws://10.0.0.5:8000/ws/orientation").unwrap(),
///     "http://10.0.0.5:8000/status"
/// );
/// assert_eq!(
///     status_url("wss://relay.example.com/ws/orientation").unwrap(),
///     "https://relay.example.com/status"
/// );
/// ```
///
/// # Errors
///
/// Returns [`ProbeError::InvalidUrl`] for non-WebSocket schemes.
pub fn status_url(ws_url: &str) -> Result<String, ProbeError> {
    let http = if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        return Err(ProbeError::InvalidUrl);
    };
    let (base, tail) = http.split_at(http.find(['?', '#']).unwrap_or(http.len()));
    Ok(match base.strip_suffix(ORIENTATION_PATH) {
        Some(root) => format!("{root}{STATUS_PATH}{tail}"),
        None => format!("{}{STATUS_PATH}{tail}", base.trim_end_matches('/')),
    })
}

/// Queries the relay status endpoint with the default timeout.
///
/// # Errors
///
/// See [`ProbeError`]; no failure panics.
pub async fn probe(ws_url: &str) -> Result<RelayStatus, ProbeError> {
    probe_with_timeout(ws_url, PROBE_TIMEOUT).await
}

/// Queries the relay status endpoint with a custom timeout.
///
/// # Errors
///
/// See [`ProbeError`]; no failure panics.
pub async fn probe_with_timeout(
    ws_url: &str,
    timeout: Duration,
) -> Result<RelayStatus, ProbeError> {
    let url = status_url(ws_url)?;
    debug!(url = %url, "probing relay status");

    let client = reqwest::Client::builder()
        .user_agent(format!("orientc/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(ProbeError::Unreachable)?;

    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(ProbeError::from_request)?;
    if !resp.status().is_success() {
        return Err(ProbeError::Status(resp.status().as_u16()));
    }
    resp.json::<RelayStatus>().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout
        } else {
            ProbeError::Body(e)
        }
    })
}
