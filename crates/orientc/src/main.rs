#![forbid(unsafe_code)]

use orientc::config::{load_config, Cli, ClientConfig, Commands};
use orientc::feed::SampleFeed;
use orientc::local_api::{self, ApiState, LocalReader, LocalWriter};
use orientc::machine::Policy;
use orientc::probe;
use orientc::stream::StreamClient;

use clap::Parser;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Local API address for client subcommands: `--listen`, else the config file.
fn daemon_addr(cli: &Cli) -> anyhow::Result<String> {
    if let Some(ref listen) = cli.listen {
        return Ok(listen.clone());
    }
    Ok(load_config(cli.config.as_deref())?.listen)
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

fn resolved_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref url) = cli.url {
        config.url = url.clone();
    }
    if let Some(ref listen) = cli.listen {
        config.listen = listen.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let config = resolved_config(cli)?;

    // Startup banner
    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ Orientation Client{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Stream{RESET}     {CYAN}{}{RESET}", config.url);
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        if let Some(fov) = config.view.fov_override_deg {
            eprintln!("  {DIM}FOV{RESET}        {fov}° (override)");
        }
        eprintln!();
    }

    info!(url = %config.url, "starting orientc daemon");

    let client = StreamClient::spawn(config.url.clone(), Policy::from(&config.reconnect));
    let stream = client.handle();
    let feed = SampleFeed::spawn(stream.subscribe_frames());

    let status_log = tokio::spawn({
        let mut statuses = stream.subscribe_status();
        let stream = stream.clone();
        async move {
            loop {
                match statuses.recv().await {
                    Ok(status) => {
                        let snap = stream.snapshot();
                        match snap.error {
                            Some(err) => warn!(%status, attempts = snap.attempts, error = %err, "stream status"),
                            None => info!(%status, attempts = snap.attempts, "stream status"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "status log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    stream.connect()?;

    let api_handle = tokio::spawn({
        let listen = config.listen.clone();
        let state = ApiState {
            stream: stream.clone(),
            samples: feed.watch(),
            fov_override: config.view.fov_override_deg,
        };
        async move {
            if let Err(e) = local_api::start_local_api(&listen, state).await {
                error!("Local API error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = api_handle => {
            info!("Local API server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    client.shutdown().await;
    status_log.abort();
    drop(feed);

    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn daemon_connect(listen: &str) -> (LocalReader, LocalWriter) {
    match local_api::connect_local(listen).await {
        Ok(halves) => halves,
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is orientc running? Try: {BOLD}orientc start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

async fn daemon_cmd(listen: &str, cmd: &str) -> anyhow::Result<String> {
    let (reader, mut writer) = daemon_connect(listen).await;
    let mut reader = tokio::io::BufReader::new(reader);

    writer.write_all(cmd.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;

    Ok(line)
}

async fn daemon_watch(listen: &str) -> anyhow::Result<()> {
    let (reader, mut writer) = daemon_connect(listen).await;
    writer.write_all(br#"{"cmd": "subscribe"}"#).await?;
    writer.write_all(b"\n").await?;

    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if tty() {
            let json: serde_json::Value = serde_json::from_str(line.trim())?;
            fmt_sample_line(&json);
        } else {
            println!("{line}");
        }
    }
    Ok(())
}

// ── Pretty formatters ───────────────────────────────────────────────

fn status_dot(status: &str) -> String {
    match status {
        "connected" => format!("{GREEN}●{RESET}"),
        "connecting" | "reconnecting" => format!("{YELLOW}●{RESET}"),
        "error" => format!("{RED}●{RESET}"),
        _ => format!("{DIM}●{RESET}"),
    }
}

fn fmt_status(json: &serde_json::Value) {
    let status = json["status"].as_str().unwrap_or("unknown");
    let v = env!("CARGO_PKG_VERSION");

    println!();
    println!("  {BOLD}◈ Orientation Client{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}Status{RESET}     {} {status}", status_dot(status));
    if let Some(url) = json["url"].as_str() {
        println!("  {DIM}Stream{RESET}     {CYAN}{url}{RESET}");
    }
    let attempts = json["attempts"].as_u64().unwrap_or(0);
    if attempts > 0 {
        println!("  {DIM}Attempts{RESET}   {attempts}");
    }
    if let Some(msg) = json["error"]["message"].as_str() {
        match json["error"]["code"].as_u64() {
            Some(code) => println!("  {DIM}Error{RESET}      {RED}{msg}{RESET} {DIM}(code {code}){RESET}"),
            None => println!("  {DIM}Error{RESET}      {RED}{msg}{RESET}"),
        }
    }
    println!();
}

fn fmt_quaternion(q: &serde_json::Value) -> String {
    let parts: Vec<String> = q
        .as_array()
        .map(|a| {
            a.iter()
                .map(|c| format!("{:+.4}", c.as_f64().unwrap_or(0.0)))
                .collect()
        })
        .unwrap_or_default();
    parts.join(" ")
}

fn fmt_latest(json: &serde_json::Value) {
    let sample = &json["sample"];
    println!();
    if sample.is_null() {
        println!("  {DIM}No orientation received yet{RESET}");
        println!();
        return;
    }

    let fov = json["effective_fov"].as_f64().unwrap_or(0.0);
    println!(
        "  {DIM}Quaternion{RESET} {CYAN}{}{RESET} {DIM}(x y z w){RESET}",
        fmt_quaternion(&sample["quaternion"])
    );
    println!("  {DIM}FOV{RESET}        {fov:.1}°");
    if let Some(latency) = sample["latency_ms"].as_i64() {
        println!("  {DIM}Latency{RESET}    {latency} ms");
    }
    if let (Some(lat), Some(lon)) = (sample["lat"].as_f64(), sample["lon"].as_f64()) {
        match sample["alt_m"].as_f64() {
            Some(alt) => println!("  {DIM}Position{RESET}   {lat:.6}, {lon:.6} @ {alt:.1} m"),
            None => println!("  {DIM}Position{RESET}   {lat:.6}, {lon:.6}"),
        }
    }
    println!();
}

fn fmt_sample_line(json: &serde_json::Value) {
    let sample = &json["sample"];
    let fov = json["effective_fov"].as_f64().unwrap_or(0.0);
    let latency = sample["latency_ms"].as_i64().unwrap_or(0);
    println!(
        "  {CYAN}{}{RESET}  {DIM}fov{RESET} {fov:.1}°  {DIM}latency{RESET} {latency} ms",
        fmt_quaternion(&sample["quaternion"])
    );
}

fn fmt_ack(json: &serde_json::Value, action: &str) {
    if let Some(err) = json["error"].as_str() {
        println!("  {RED}✗{RESET} {err}");
    } else {
        println!("  {GREEN}✓{RESET} {action}");
    }
}

async fn control(cli: &Cli, cmd: &serde_json::Value, action: &str) -> anyhow::Result<()> {
    let addr = daemon_addr(cli)?;
    let resp = daemon_cmd(&addr, &serde_json::to_string(cmd)?).await?;

    if tty() {
        let json: serde_json::Value = serde_json::from_str(resp.trim())?;
        fmt_ack(&json, action);
    } else {
        print!("{resp}");
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Start => run_daemon(&cli).await?,

        Commands::Status => {
            let addr = daemon_addr(&cli)?;
            let resp = daemon_cmd(&addr, r#"{"cmd": "status"}"#).await?;

            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_status(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Latest => {
            let addr = daemon_addr(&cli)?;
            let resp = daemon_cmd(&addr, r#"{"cmd": "latest"}"#).await?;

            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_latest(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Watch => {
            let addr = daemon_addr(&cli)?;
            daemon_watch(&addr).await?;
        }

        Commands::Connect => {
            control(&cli, &serde_json::json!({"cmd": "connect"}), "Connecting").await?;
        }

        Commands::Disconnect => {
            control(&cli, &serde_json::json!({"cmd": "disconnect"}), "Disconnected").await?;
        }

        Commands::Retry => {
            control(&cli, &serde_json::json!({"cmd": "retry"}), "Reconnecting").await?;
        }

        Commands::SetUrl { url } => {
            if !orientc::machine::is_websocket_url(url) {
                if tty() {
                    println!("  {RED}✗{RESET} URL must start with ws:// or wss://");
                } else {
                    let err = serde_json::json!({"error": "url must start with ws:// or wss://"});
                    print!("{}", serde_json::to_string(&err)?);
                }
                std::process::exit(1);
            }
            let cmd = serde_json::json!({"cmd": "set_url", "url": url});
            control(&cli, &cmd, &format!("Switched to {url}")).await?;
        }

        Commands::Probe => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(ref url) = cli.url {
                config.url = url.clone();
            }
            let target = probe::status_url(&config.url).unwrap_or_else(|_| config.url.clone());

            match probe::probe(&config.url).await {
                Ok(status) => {
                    if tty() {
                        println!(
                            "  {GREEN}✓{RESET} Server is running. {BOLD}{}{RESET} clients connected. {DIM}({target}){RESET}",
                            status.clients_connected
                        );
                    } else {
                        println!("{}", serde_json::to_string(&status)?);
                    }
                }
                Err(e) => {
                    if tty() {
                        println!("  {RED}✗{RESET} {e} {DIM}({target}){RESET}");
                    } else {
                        let err = serde_json::json!({"error": e.to_string(), "url": target});
                        println!("{}", serde_json::to_string(&err)?);
                    }
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
