//! signal-cli daemon transport adapter.
//!
//! Owns one long-lived UNIX-socket connection to `signal-cli daemon
//! --socket <path>` speaking newline-delimited JSON-RPC. One reader task is
//! the sole inbound source: lines carrying a correlation id resolve their
//! pending call; `receive` notifications go to the dispatcher channel exactly
//! once; malformed lines are dropped and logged.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{unix::OwnedWriteHalf, UnixStream},
    sync::{mpsc, oneshot},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use sgb_core::{
    domain::InboundMessage,
    errors::Error,
    rpc::{envelope_to_inbound, Envelope, Transport},
    Result,
};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A connection must stay up this long before the backoff resets.
const STABILITY_WINDOW: Duration = Duration::from_secs(30);

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<serde_json::Value>>,
}

struct Inner {
    socket_path: PathBuf,
    pending: Mutex<HashMap<String, PendingCall>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    notify_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
}

/// The daemon connection. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct SignalCliTransport {
    inner: Arc<Inner>,
}

impl SignalCliTransport {
    /// `notify_tx` receives every inbound message notification exactly once.
    pub fn new(socket_path: impl Into<PathBuf>, notify_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                socket_path: socket_path.into(),
                pending: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                notify_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the connection manager (connect, read, reconnect with backoff).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(connection_loop(inner))
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.writer.lock().await = None;
        fail_all_pending(&self.inner, "shutting down");
    }
}

#[async_trait]
impl Transport for SignalCliTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            // UUIDs make collisions practically impossible; the invariant is
            // still: one pending call per correlation id.
            debug_assert!(!pending.contains_key(&id));
            pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');

        {
            let mut guard = self.inner.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                self.remove_pending(&id);
                return Err(Error::Transport("not connected".to_string()));
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.remove_pending(&id);
                return Err(Error::Transport(format!("write failed: {e}")));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport(
                "connection lost before response".to_string(),
            )),
            Err(_) => {
                // Discard the pending call; a late response will be logged
                // and dropped by the reader.
                self.remove_pending(&id);
                Err(Error::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn pending_calls(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl SignalCliTransport {
    fn remove_pending(&self, id: &str) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

async fn connection_loop(inner: Arc<Inner>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        match UnixStream::connect(&inner.socket_path).await {
            Ok(stream) => {
                println!("[RPC] connected to {}", inner.socket_path.display());
                let connected_at = Instant::now();
                let (read_half, write_half) = stream.into_split();
                *inner.writer.lock().await = Some(write_half);
                inner.connected.store(true, Ordering::SeqCst);

                read_loop(&inner, read_half).await;

                inner.connected.store(false, Ordering::SeqCst);
                *inner.writer.lock().await = None;
                fail_all_pending(&inner, "connection lost");

                if connected_at.elapsed() >= STABILITY_WINDOW {
                    backoff = INITIAL_BACKOFF;
                }
            }
            Err(e) => {
                eprintln!(
                    "[RPC] connect to {} failed: {e}",
                    inner.socket_path.display()
                );
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn read_loop(inner: &Arc<Inner>, read_half: tokio::net::unix::OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(inner, &line).await,
                    Ok(None) => {
                        eprintln!("[RPC] connection closed by peer");
                        return;
                    }
                    Err(e) => {
                        eprintln!("[RPC] read failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_line(inner: &Arc<Inner>, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            let err = Error::MalformedFrame(format!("{e}: {}", preview(line, 120)));
            eprintln!("[RPC] dropping {err}");
            return;
        }
    };

    if let Some(id) = correlation_id(&value) {
        resolve_pending(inner, &id, value);
        return;
    }

    // No correlation id: an asynchronous notification.
    match value.get("method").and_then(|m| m.as_str()) {
        Some("receive") => forward_notification(inner, value).await,
        other => {
            eprintln!(
                "[RPC] dropping frame without correlation id (method: {})",
                other.unwrap_or("<none>")
            );
        }
    }
}

fn correlation_id(value: &serde_json::Value) -> Option<String> {
    match value.get("id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_pending(inner: &Arc<Inner>, id: &str, value: serde_json::Value) {
    let call = inner
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(id);

    let Some(call) = call else {
        // Timed out (or never ours): log and drop.
        eprintln!("[RPC] dropping late response for {id}");
        return;
    };

    let outcome = if let Some(err) = value.get("error") {
        Err(Error::Rpc {
            code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string(),
        })
    } else {
        Ok(value
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    };

    // The caller may have timed out between our map lookup and this send;
    // that is the same late-response case.
    if call.tx.send(outcome).is_err() {
        eprintln!("[RPC] dropping late response for {} ({id})", call.method);
    }
}

async fn forward_notification(inner: &Arc<Inner>, value: serde_json::Value) {
    let Some(envelope) = value.pointer("/params/envelope").cloned() else {
        eprintln!("[RPC] dropping receive frame without envelope");
        return;
    };

    let envelope: Envelope = match serde_json::from_value(envelope) {
        Ok(v) => v,
        Err(e) => {
            let err = Error::MalformedFrame(format!("envelope: {e}"));
            eprintln!("[RPC] dropping {err}");
            return;
        }
    };

    // Receipts/typing indicators carry no text; nothing to dispatch.
    let Some(message) = envelope_to_inbound(envelope) else {
        return;
    };

    if inner.notify_tx.send(message).await.is_err() {
        eprintln!("[RPC] notification channel closed; dropping message");
    }
}

fn fail_all_pending(inner: &Arc<Inner>, reason: &str) {
    let drained: Vec<(String, PendingCall)> = {
        let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.drain().collect()
    };
    for (_, call) in drained {
        let _ = call
            .tx
            .send(Err(Error::Transport(format!("{}: {reason}", call.method))));
    }
}

fn preview(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
