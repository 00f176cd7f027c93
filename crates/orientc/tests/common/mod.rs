#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use orientc::backoff::ExponentialBackoff;
use orientc::machine::Policy;
use orientc::stream::{ConnSnapshot, StreamHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
enum RelayCmd {
    Text(String),
    Close(u16, String),
    Drop,
}

/// In-process stand-in for the orientation relay.
pub struct TestRelay {
    pub addr: SocketAddr,
    cmds: broadcast::Sender<RelayCmd>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (cmds, _) = broadcast::channel(64);
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cmds = cmds.clone();
            let accepted = Arc::clone(&accepted);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    // Subscribe before the handshake so no command sent after
                    // the client reports "connected" can be missed.
                    let rx = cmds.subscribe();
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, rx));
                }
            }
        });

        Self {
            addr,
            cmds,
            accepted,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/orientation", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.cmds.send(RelayCmd::Text(text.to_string()));
    }

    pub fn close_all(&self, code: u16, reason: &str) {
        let _ = self.cmds.send(RelayCmd::Close(code, reason.to_string()));
    }

    /// Drops every socket without a closing handshake.
    pub fn drop_all(&self) {
        let _ = self.cmds.send(RelayCmd::Drop);
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: tokio::net::TcpStream, mut cmds: broadcast::Receiver<RelayCmd>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Ok(RelayCmd::Text(text)) => {
                    if ws.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(RelayCmd::Close(code, reason)) => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                        .await;
                    while let Some(Ok(_)) = ws.next().await {}
                    return;
                }
                Ok(RelayCmd::Drop) | Err(_) => return,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    while let Some(Ok(_)) = ws.next().await {}
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Listener that accepts TCP connections but never answers the handshake.
pub async fn silent_listener() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn fast_policy() -> Policy {
    Policy {
        backoff: ExponentialBackoff::new(
            Duration::from_millis(50),
            Duration::from_millis(200),
            2.0,
        ),
        max_attempts: 3,
        connect_timeout: Duration::from_secs(2),
        force_reconnect_delay: Duration::from_millis(20),
    }
}

pub async fn wait_for_snapshot(
    handle: &StreamHandle,
    pred: impl FnMut(&ConnSnapshot) -> bool,
) -> ConnSnapshot {
    let mut rx = handle.watch_snapshot();
    let snap = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("stream actor stopped");
    snap.clone()
}
