//! Orientation frame decoding.
//!
//! The relay pushes JSON text frames shaped like
//! `{"q":[w,x,y,z],"fov_deg":40,"ts_unix_ms":1700000000000,"lat":..,"lon":..,"alt_m":..}`.
//! [`decode`] validates one frame into an [`OrientationSample`]. The stateful
//! [`OrientationDecoder`] keeps the most recent good sample and silently drops
//! anything that does not decode.

use crate::types::{DEFAULT_FOV_DEG, QUATERNION_LEN};
use glam::DQuat;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Inbound wire message as published by the relay.
///
/// Every field is optional at the JSON level; [`decode`] decides which ones
/// are required. Only `q` can reject a frame: the other fields read as
/// `None` when they hold a value of the wrong type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireFrame {
    /// Quaternion in (w, x, y, z) order.
    pub q: Option<Vec<f64>>,
    /// Camera field of view in degrees.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fov_deg: Option<f64>,
    /// Source timestamp in milliseconds since the Unix epoch.
    #[serde(default, deserialize_with = "lenient_millis")]
    pub ts_unix_ms: Option<i64>,
    /// Latitude in degrees.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    /// Longitude in degrees.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: Option<f64>,
    /// Altitude in meters.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub alt_m: Option<f64>,
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_f64())
}

/// Integer milliseconds, or a finite float truncated toward zero.
#[allow(clippy::cast_possible_truncation)]
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && ms.abs() < 9.0e18)
            .map(|ms| ms as i64)
    }))
}

/// A decoded, validated orientation update.
///
/// Created fresh for every accepted frame and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationSample {
    /// Unit quaternion, serialized as `[x, y, z, w]`.
    pub quaternion: DQuat,
    /// Field of view in degrees.
    pub fov_deg: f64,
    /// Source timestamp, or local receipt time when the frame had none.
    pub timestamp_ms: i64,
    /// Receipt time minus source timestamp; zero when the frame had no timestamp.
    pub latency_ms: i64,
    /// Latitude in degrees, passed through unvalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude in degrees, passed through unvalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Altitude in meters, passed through unvalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_m: Option<f64>,
}

impl OrientationSample {
    /// Field of view to render with, honoring an operator override.
    ///
    /// Overrides that are not finite and positive are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use orient_common::decode;
    /// let sample = decode(r#"{"q":[1,0,0,0],"fov_deg":55}"#, 0).unwrap();
    /// assert_eq!(sample.effective_fov(None), 55.0);
    /// assert_eq!(sample.effective_fov(Some(70.0)), 70.0);
    /// ```
    #[must_use]
    pub fn effective_fov(&self, override_deg: Option<f64>) -> f64 {
        match override_deg {
            Some(fov) if fov.is_finite() && fov > 0.0 => fov,
            _ => self.fov_deg,
        }
    }
}

/// Reasons a frame was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was an empty string.
    #[error("frame is empty")]
    Empty,
    /// The frame is not valid JSON or `q` has the wrong type.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The `q` field is absent.
    #[error("missing quaternion field")]
    MissingQuaternion,
    /// The `q` array does not have exactly four components.
    #[error("quaternion must have {QUATERNION_LEN} components, got {0}")]
    QuaternionLength(usize),
    /// The quaternion has zero length and cannot be normalized.
    #[error("quaternion has zero norm")]
    ZeroNorm,
}

/// Decodes one raw text frame received at `received_at_ms`.
///
/// The quaternion is normalized to unit length and reordered from the wire's
/// (w, x, y, z) to (x, y, z, w).
///
/// # Errors
///
/// Returns [`DecodeError`] if the frame is empty, not JSON, or lacks a
/// usable four-component quaternion.
///
/// # Examples
///
/// ```
/// use orient_common::decode;
/// let sample = decode(r#"{"q":[1,0,0,0],"fov_deg":55,"ts_unix_ms":1000}"#, 1120).unwrap();
/// assert_eq!(sample.quaternion.to_array(), [0.0, 0.0, 0.0, 1.0]);
/// assert_eq!(sample.fov_deg, 55.0);
/// assert_eq!(sample.latency_ms, 120);
/// ```
pub fn decode(raw: &str, received_at_ms: i64) -> Result<OrientationSample, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    let frame: WireFrame = serde_json::from_str(raw)?;
    let q = frame.q.ok_or(DecodeError::MissingQuaternion)?;
    let [w, x, y, z]: [f64; QUATERNION_LEN] = q
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError::QuaternionLength(q.len()))?;

    let quaternion = normalize(w, x, y, z).ok_or(DecodeError::ZeroNorm)?;

    let fov_deg = match frame.fov_deg {
        Some(fov) if fov.is_finite() && fov != 0.0 => fov,
        _ => DEFAULT_FOV_DEG,
    };

    let (timestamp_ms, latency_ms) = match frame.ts_unix_ms {
        Some(ts) if ts != 0 => (ts, received_at_ms.saturating_sub(ts)),
        _ => (received_at_ms, 0),
    };

    Ok(OrientationSample {
        quaternion,
        fov_deg,
        timestamp_ms,
        latency_ms,
        lat: frame.lat,
        lon: frame.lon,
        alt_m: frame.alt_m,
    })
}

/// Scales (w, x, y, z) to unit length, or `None` when the norm is zero.
///
/// Components are pre-scaled by the largest magnitude so that very large
/// inputs cannot overflow the sum of squares.
fn normalize(w: f64, x: f64, y: f64, z: f64) -> Option<DQuat> {
    let scale = [w, x, y, z].iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let (w, x, y, z) = (w / scale, x / scale, y / scale, z / scale);
    let norm = (w * w + x * x + y * y + z * z).sqrt();
    Some(DQuat::from_xyzw(x / norm, y / norm, z / norm, w / norm))
}

/// Keeps the most recent valid sample from a stream of raw frames.
#[derive(Debug, Default)]
pub struct OrientationDecoder {
    current: Option<OrientationSample>,
    accepted: u64,
    discarded: u64,
}

impl OrientationDecoder {
    /// Creates a decoder with no current sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `raw` and, on success, makes it the current sample.
    ///
    /// Returns the new sample, or `None` if the frame was discarded. A
    /// discarded frame leaves the previous sample in place.
    pub fn accept(&mut self, raw: &str, received_at_ms: i64) -> Option<OrientationSample> {
        match decode(raw, received_at_ms) {
            Ok(sample) => {
                self.accepted += 1;
                self.current = Some(sample);
                Some(sample)
            }
            Err(DecodeError::Json(e)) => {
                self.discarded += 1;
                warn!(error = %e, "failed to parse orientation data");
                None
            }
            Err(e) => {
                self.discarded += 1;
                debug!(error = %e, "discarding orientation frame");
                None
            }
        }
    }

    /// The most recent valid sample, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&OrientationSample> {
        self.current.as_ref()
    }

    /// Number of frames that produced a sample.
    #[must_use]
    pub const fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Number of frames that were dropped.
    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }
}
