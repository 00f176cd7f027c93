use crate::backoff::ExponentialBackoff;
use crate::machine::{is_websocket_url, Policy};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the orientation stream client.
#[derive(Parser)]
#[command(name = "orientc", about = "Orientation stream client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Orientation stream URL override (`ws://` or `wss://`).
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the client daemon.
    Start,
    /// Show connection status.
    Status,
    /// Print the current orientation sample.
    Latest,
    /// Stream orientation samples as they arrive.
    Watch,
    /// Ask the daemon to connect.
    Connect,
    /// Ask the daemon to disconnect and stop reconnecting.
    Disconnect,
    /// Reset the reconnect budget and reconnect now.
    Retry,
    /// Point the daemon at a different stream URL.
    SetUrl {
        /// New `ws://` or `wss://` URL.
        url: String,
    },
    /// Check the relay's HTTP status endpoint.
    Probe,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the orientation stream.
    pub url: String,
    /// Local API listen address (`tcp://` or `unix://`).
    pub listen: String,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectConfig,
    /// Presentation hints passed through to API consumers.
    #[serde(default)]
    pub view: ViewConfig,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Automatic attempts before the client gives up.
    pub max_attempts: u32,
    /// How long a connection may take to open, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Pause between disconnect and connect on a forced reconnect, in milliseconds.
    pub force_delay_ms: u64,
    /// Randomize each delay by up to 25% either way.
    pub jitter: bool,
}

/// Optional presentation settings.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ViewConfig {
    /// Field of view to report instead of the one carried by frames, in degrees.
    pub fov_override_deg: Option<f64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/orientation".to_string(),
            listen: "tcp://127.0.0.1:7710".to_string(),
            reconnect: ReconnectConfig::default(),
            view: ViewConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
            max_attempts: 10,
            connect_timeout_ms: 5000,
            force_delay_ms: 100,
            jitter: false,
        }
    }
}

impl From<&ReconnectConfig> for Policy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                Duration::from_millis(cfg.initial_delay_ms),
                Duration::from_millis(cfg.max_delay_ms),
                cfg.backoff_factor,
            )
            .with_jitter(cfg.jitter),
            max_attempts: cfg.max_attempts,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            force_reconnect_delay: Duration::from_millis(cfg.force_delay_ms),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("stream URL must not be empty".to_string());
        }
        if !is_websocket_url(&self.url) {
            return Err(format!(
                "stream URL must start with ws:// or wss://, got: {}",
                self.url
            ));
        }

        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if !(self.listen.starts_with("tcp://") || self.listen.starts_with("unix://")) {
            return Err(format!(
                "listen address must start with tcp:// or unix://, got: {}",
                self.listen
            ));
        }

        let r = &self.reconnect;
        if r.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if r.max_delay_ms < r.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !r.backoff_factor.is_finite() || r.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }
        if r.max_attempts == 0 {
            return Err("reconnect.max_attempts must be greater than 0".to_string());
        }
        if r.connect_timeout_ms == 0 {
            return Err("reconnect.connect_timeout_ms must be greater than 0".to_string());
        }

        if let Some(fov) = self.view.fov_override_deg {
            if !fov.is_finite() || fov <= 0.0 || fov >= 180.0 {
                return Err(format!(
                    "view.fov_override_deg must be between 0 and 180 degrees, got: {fov}"
                ));
            }
        }

        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let r = &defaults.reconnect;
    let mut builder = config::Config::builder()
        .set_default("url", defaults.url.as_str())?
        .set_default("listen", defaults.listen.as_str())?
        .set_default("reconnect.initial_delay_ms", r.initial_delay_ms as i64)?
        .set_default("reconnect.max_delay_ms", r.max_delay_ms as i64)?
        .set_default("reconnect.backoff_factor", r.backoff_factor)?
        .set_default("reconnect.max_attempts", i64::from(r.max_attempts))?
        .set_default("reconnect.connect_timeout_ms", r.connect_timeout_ms as i64)?
        .set_default("reconnect.force_delay_ms", r.force_delay_ms as i64)?
        .set_default("reconnect.jitter", r.jitter)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform config dir first, then ~/.config/orientc/ (used on macOS too)
        let native_path = dirs::config_dir().map(|d| d.join("orientc").join("config.toml"));
        let xdg_path =
            dirs::home_dir().map(|d| d.join(".config").join("orientc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORIENTC")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
