//! In-process event-bus server for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use miner_core::BackoffConfig;
use miner_pubsub::ClientConfig;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the server observed.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    Connected(usize),
    Text(usize, Value),
    Close(usize),
    Disconnected(usize),
}

/// Canned replies.
#[derive(Clone, Copy, Debug)]
pub struct MockOptions {
    /// Answer LISTEN/UNLISTEN with a successful RESPONSE.
    pub answer_requests: bool,
    /// Answer PING with PONG.
    pub answer_pings: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            answer_requests: true,
            answer_pings: true,
        }
    }
}

enum Control {
    Send(String),
    Drop,
}

struct Recorded {
    events: Mutex<Vec<ServerEvent>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
}

impl Recorded {
    fn push(&self, event: ServerEvent) {
        self.events.lock().push(event);
    }
}

pub struct MockServer {
    pub url: String,
    recorded: Arc<Recorded>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded {
            events: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });

        let accept = {
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let id = {
                        let mut connections = recorded.connections.lock();
                        connections.push(tx);
                        connections.len() - 1
                    };
                    drop(tokio::spawn(serve(stream, id, rx, Arc::clone(&recorded), options)));
                }
            })
        };

        Self {
            url: format!("ws://{addr}"),
            recorded,
            accept,
        }
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.recorded.events.lock().clone()
    }

    /// Connections that completed the handshake.
    pub fn connection_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ServerEvent::Connected(_)))
            .count()
    }

    /// Text frames of `kind` received on connection `id`.
    pub fn commands_on(&self, id: usize, kind: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Text(conn, v) if conn == id && v["type"] == kind => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Text frames of `kind` received on any connection.
    pub fn commands(&self, kind: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Text(_, v) if v["type"] == kind => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Send a text frame on the newest connection.
    pub fn send(&self, frame: impl Into<String>) {
        let connections = self.recorded.connections.lock();
        let tx = connections.last().expect("no connection");
        tx.send(Control::Send(frame.into())).unwrap();
    }

    pub fn send_json(&self, frame: &Value) {
        self.send(frame.to_string());
    }

    /// Drop the newest connection without a close handshake.
    pub fn drop_latest(&self) {
        let connections = self.recorded.connections.lock();
        if let Some(tx) = connections.last() {
            let _ = tx.send(Control::Drop);
        }
    }

    pub async fn wait_for_connections(&self, count: usize) {
        eventually(|| self.connection_count() >= count).await;
    }

    /// Wait for a command of `kind` and return it.
    pub async fn wait_for_command(&self, kind: &str) -> Value {
        eventually(|| !self.commands(kind).is_empty()).await;
        self.commands(kind).remove(0)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(
    stream: TcpStream,
    id: usize,
    mut control: mpsc::UnboundedReceiver<Control>,
    recorded: Arc<Recorded>,
    options: MockOptions,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    recorded.push(ServerEvent::Connected(id));
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    recorded.push(ServerEvent::Text(id, value.clone()));
                    if let Some(reply) = canned_reply(&value, options) {
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    recorded.push(ServerEvent::Close(id));
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            ctl = control.recv() => match ctl {
                Some(Control::Send(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Drop) | None => break,
            },
        }
    }
    recorded.push(ServerEvent::Disconnected(id));
}

fn canned_reply(command: &Value, options: MockOptions) -> Option<Value> {
    match command["type"].as_str()? {
        "LISTEN" | "UNLISTEN" if options.answer_requests => Some(json!({
            "type": "RESPONSE",
            "nonce": command["nonce"],
            "error": "",
        })),
        "PING" if options.answer_pings => Some(json!({ "type": "PONG" })),
        _ => None,
    }
}

/// Client settings scaled down for tests.
pub fn test_config(url: &str) -> ClientConfig {
    ClientConfig {
        url: url.to_owned(),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_millis(500),
        ping_interval: Duration::from_millis(100),
        liveness_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(20),
        max_topics: 50,
        backoff: BackoffConfig {
            base_delay_ms: 20,
            max_delay_ms: 100,
            jitter_factor: 0.0,
        },
    }
}

/// Poll `check` until it holds, panicking after [`TIMEOUT`].
pub async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut` with [`TIMEOUT`].
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out")
}
