use crate::stream::{ConnSnapshot, StreamHandle};
use orient_common::OrientationSample;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Maximum command line length (1 MB). Prevents unbounded memory allocation
/// from a misbehaving local process sending an enormous line.
const MAX_CMD_LEN: usize = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ApiCommand {
    Status,
    Latest,
    Subscribe,
    Connect,
    Disconnect,
    Retry,
    SetUrl { url: String },
}

#[derive(Debug, Clone, Serialize)]
struct SampleResponse {
    sample: Option<OrientationSample>,
    effective_fov: Option<f64>,
}

impl SampleResponse {
    fn new(sample: Option<OrientationSample>, fov_override: Option<f64>) -> Self {
        Self {
            effective_fov: sample.map(|s| s.effective_fov(fov_override)),
            sample,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AckResponse {
    ok: bool,
    snapshot: ConnSnapshot,
}

/// Everything a local API client can observe or control.
#[derive(Clone)]
pub struct ApiState {
    /// Control handle of the stream actor.
    pub stream: StreamHandle,
    /// Current decoded sample.
    pub samples: watch::Receiver<Option<OrientationSample>>,
    /// Operator field-of-view override applied to `effective_fov`.
    pub fov_override: Option<f64>,
}

/// # Errors
///
/// Returns an error if binding the local API listener fails.
pub async fn start_local_api(listen: &str, state: ApiState) -> anyhow::Result<()> {
    if let Some(path) = listen.strip_prefix("unix://") {
        let listener = tokio::net::UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Local API listening on unix socket: {}", path);

        loop {
            let (stream, _) = listener.accept().await?;
            let (reader, writer) = stream.into_split();
            spawn_client(reader, writer, state.clone());
        }
    } else if let Some(addr) = listen.strip_prefix("tcp://") {
        let listener = TcpListener::bind(addr).await?;
        info!("Local API listening on TCP: {}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let (reader, writer) = stream.into_split();
            spawn_client(reader, writer, state.clone());
        }
    } else {
        anyhow::bail!(
            "Invalid listen address format: {listen}. Use unix://path or tcp://addr:port"
        );
    }
}

/// Read half of a client connection to the local API.
pub type LocalReader = Box<dyn AsyncRead + Unpin + Send>;
/// Write half of a client connection to the local API.
pub type LocalWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Connects to a local API listening on `listen` (`tcp://` or `unix://`).
///
/// # Errors
///
/// Returns an error for an unknown address scheme or if the connection fails.
pub async fn connect_local(listen: &str) -> anyhow::Result<(LocalReader, LocalWriter)> {
    if let Some(path) = listen.strip_prefix("unix://") {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    } else if let Some(addr) = listen.strip_prefix("tcp://") {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    } else {
        anyhow::bail!(
            "Invalid listen address format: {listen}. Use unix://path or tcp://addr:port"
        );
    }
}

fn spawn_client<R, W>(reader: R, writer: W, state: ApiState)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_local_client(reader, writer, state).await {
            debug!("Client handler error: {}", e);
        }
    });
}

fn error_line(message: impl std::fmt::Display) -> anyhow::Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({"error": message.to_string()}))? + "\n")
}

async fn handle_local_client<R, W>(
    reader: R,
    mut writer: W,
    mut state: ApiState,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if line.len() > MAX_CMD_LEN {
            let error = error_line(format!(
                "command exceeds maximum length ({MAX_CMD_LEN} bytes)"
            ))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                writer.write_all(error_line(e)?.as_bytes()).await?;
                continue;
            }
        };
        debug!(?cmd, "local API command");

        let control = match cmd {
            ApiCommand::Status => {
                let resp = serde_json::to_string(&state.stream.snapshot())? + "\n";
                writer.write_all(resp.as_bytes()).await?;
                continue;
            }
            ApiCommand::Latest => {
                let sample = *state.samples.borrow();
                let resp = SampleResponse::new(sample, state.fov_override);
                writer
                    .write_all((serde_json::to_string(&resp)? + "\n").as_bytes())
                    .await?;
                continue;
            }
            ApiCommand::Subscribe => {
                handle_subscribe(&mut state, &mut writer).await?;
                return Ok(());
            }
            ApiCommand::Connect => state.stream.connect(),
            ApiCommand::Disconnect => state.stream.disconnect(),
            ApiCommand::Retry => state.stream.force_reconnect(),
            ApiCommand::SetUrl { url } => state.stream.set_url(url),
        };

        let response = match control {
            Ok(()) => {
                let resp = AckResponse {
                    ok: true,
                    snapshot: state.stream.snapshot(),
                };
                serde_json::to_string(&resp)? + "\n"
            }
            Err(e) => error_line(e)?,
        };
        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_subscribe<W>(state: &mut ApiState, writer: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let _ = state.samples.borrow_and_update();
    while state.samples.changed().await.is_ok() {
        let sample = *state.samples.borrow_and_update();
        if sample.is_none() {
            continue;
        }
        let resp = SampleResponse::new(sample, state.fov_override);
        if let Ok(json) = serde_json::to_string(&resp) {
            if writer.write_all((json + "\n").as_bytes()).await.is_err() {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{ConnStatus, Policy, TransportId};
    use crate::stream::StreamClient;
    use crate::transport::Connector;
    use glam::DQuat;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::io::AsyncBufReadExt;

    struct IdleConnector;

    impl Connector for IdleConnector {
        fn open(&mut self, _id: TransportId, _url: String) {}
        fn close(&mut self, _id: TransportId, _code: u16, _reason: String) {}
        fn abort(&mut self, _id: TransportId) {}
    }

    fn sample() -> OrientationSample {
        OrientationSample {
            quaternion: DQuat::from_xyzw(0.0, 0.0, 0.0, 1.0),
            fov_deg: 50.0,
            timestamp_ms: 1_700_000_000_000,
            latency_ms: 12,
            lat: Some(47.6),
            lon: Some(-122.3),
            alt_m: None,
        }
    }

    fn setup(
        initial: Option<OrientationSample>,
        fov_override: Option<f64>,
    ) -> (StreamClient, watch::Sender<Option<OrientationSample>>, ApiState) {
        let client = StreamClient::spawn_with(
            "ws://localhost:8000/ws/orientation",
            Policy::default(),
            |_| IdleConnector,
        );
        let (sample_tx, samples) = watch::channel(initial);
        let state = ApiState {
            stream: client.handle(),
            samples,
            fov_override,
        };
        (client, sample_tx, state)
    }

    async fn send_command_and_get_response(
        client_writer: &mut (impl AsyncWrite + Unpin),
        client_reader: &mut (impl AsyncRead + Unpin),
        command: &str,
    ) -> serde_json::Value {
        client_writer.write_all(command.as_bytes()).await.unwrap();
        client_writer.shutdown().await.unwrap();

        let mut response = String::new();
        let mut buf_reader = BufReader::new(client_reader);
        buf_reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    async fn run_command(state: ApiState, command: &str) -> serde_json::Value {
        let (mut client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(4096);
        tokio::spawn(async move {
            handle_local_client(server_reader, server_writer, state)
                .await
                .unwrap();
        });
        send_command_and_get_response(&mut client_writer, &mut client_reader, command).await
    }

    #[tokio::test]
    async fn status_command_returns_snapshot() {
        let (_client, _tx, state) = setup(None, None);
        let json = run_command(state, "{\"cmd\":\"status\"}\n").await;

        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["attempts"], 0);
        assert_eq!(json["url"], "ws://localhost:8000/ws/orientation");
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn latest_command_returns_null_before_first_sample() {
        let (_client, _tx, state) = setup(None, None);
        let json = run_command(state, "{\"cmd\":\"latest\"}\n").await;

        assert!(json["sample"].is_null());
        assert!(json["effective_fov"].is_null());
    }

    #[tokio::test]
    async fn latest_command_applies_fov_override() {
        let (_client, _tx, state) = setup(Some(sample()), Some(70.0));
        let json = run_command(state, "{\"cmd\":\"latest\"}\n").await;

        assert_eq!(json["sample"]["fov_deg"], 50.0);
        assert_eq!(json["effective_fov"], 70.0);
        assert_eq!(json["sample"]["latency_ms"], 12);
    }

    #[tokio::test]
    async fn connect_command_changes_status() {
        let (client, _tx, state) = setup(None, None);
        let mut snapshots = client.handle().watch_snapshot();
        let json = run_command(state, "{\"cmd\":\"connect\"}\n").await;
        assert_eq!(json["ok"], true);

        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.status == ConnStatus::Connecting),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn set_url_command_switches_endpoint() {
        let (client, _tx, state) = setup(None, None);
        let mut snapshots = client.handle().watch_snapshot();
        let json = run_command(
            state,
            "{\"cmd\":\"set_url\",\"url\":\"ws://10.1.1.1:8000/ws/orientation\"}\n",
        )
        .await;
        assert_eq!(json["ok"], true);

        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.url == "ws://10.1.1.1:8000/ws/orientation"),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn control_command_after_shutdown_returns_error() {
        let (client, _tx, state) = setup(None, None);
        client.shutdown().await;
        let json = run_command(state, "{\"cmd\":\"retry\"}\n").await;
        assert_eq!(json["error"], "stream client has shut down");
    }

    #[tokio::test]
    async fn subscribe_streams_new_samples() {
        let (_client, sample_tx, state) = setup(None, None);
        let (client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(4096);
        tokio::spawn(async move {
            let _ = handle_local_client(server_reader, server_writer, state).await;
        });

        client_writer
            .write_all(b"{\"cmd\":\"subscribe\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sample_tx.send_replace(Some(sample()));

        let mut lines = BufReader::new(client_reader).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["effective_fov"], 50.0);
        assert_eq!(json["sample"]["lat"], 47.6);
    }

    #[tokio::test]
    async fn invalid_json_returns_error() {
        let (_client, _tx, state) = setup(None, None);
        let json = run_command(state, "not json\n").await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_command_returns_error() {
        let (_client, _tx, state) = setup(None, None);
        let json = run_command(state, "{\"cmd\":\"unknown\"}\n").await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let (_client, _tx, state) = setup(None, None);
        let (mut client_reader, server_writer) = duplex(4096);
        let (mut client_writer, server_reader) = duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = handle_local_client(server_reader, server_writer, state).await;
        });

        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..17 {
                if client_writer.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            let _ = client_writer.write_all(b"\n").await;
            let _ = client_writer.shutdown().await;
        });

        let mut response = String::new();
        BufReader::new(&mut client_reader)
            .read_line(&mut response)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("maximum length"));
        writer.abort();
    }

    #[tokio::test]
    async fn test_connect_local_over_unix_socket() {
        let path = std::env::temp_dir().join(format!("orientc-api-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listen = format!("unix://{}", path.display());

        let (client, _sample_tx, state) = setup(None, None);
        let server = tokio::spawn({
            let listen = listen.clone();
            async move {
                let _ = start_local_api(&listen, state).await;
            }
        });

        let (reader, mut writer) = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(halves) = connect_local(&listen).await {
                    return halves;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        writer.write_all(b"{\"cmd\":\"status\"}\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(json["status"], "disconnected");

        server.abort();
        client.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_connect_local_rejects_unknown_scheme() {
        let err = connect_local("http://127.0.0.1:7710").await.err().unwrap();
        assert!(err.to_string().contains("Invalid listen address format"));
    }
}
