//! Protocol constants shared by the orientation stream tools.

/// Path suffix of the relay's orientation stream endpoint.
pub const ORIENTATION_PATH: &str = "/ws/orientation";

/// Path of the relay's HTTP status endpoint.
pub const STATUS_PATH: &str = "/status";

/// Field of view assumed when a frame carries none, in degrees.
pub const DEFAULT_FOV_DEG: f64 = 40.0;

/// Number of quaternion components expected in the `q` field.
pub const QUATERNION_LEN: usize = 4;

/// WebSocket close codes the stream client distinguishes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Endpoint received a data type it cannot accept.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}
