use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Transport-level RPC failures. Never retried here; retry policy belongs to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("device is offline")]
    Offline,
    #[error("rpc request timed out after {0:?}")]
    Timeout(Duration),
    #[error("device disconnected")]
    Disconnected,
    #[error("request message carries no correlation id")]
    MissingCorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub user_id: String,
}

/// Issuer state for daemon bearer tokens.
pub trait DeviceTokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<DeviceIdentity>;
}

/// Token table loaded from steward.toml. Real deployments would back this
/// with the token issuer's store; the channel only needs the lookup.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, DeviceIdentity>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, DeviceIdentity>) -> Self {
        Self { tokens }
    }
}

impl DeviceTokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<DeviceIdentity> {
        self.tokens.get(token).cloned()
    }
}

struct DeviceConnection {
    user_id: String,
    conn_id: String,
    outbox: mpsc::Sender<Message>,
    last_heartbeat: Instant,
}

struct PendingRpc {
    device_id: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

struct StreamListener {
    device_id: String,
    tx: mpsc::Sender<Value>,
}

/// Persistent, authenticated, bidirectional JSON messaging with remote
/// daemons. One live connection per device id (last writer wins); many
/// concurrent correlated requests and chunk streams multiplex over it.
pub struct DeviceChannel {
    connections: Mutex<HashMap<String, DeviceConnection>>,
    pending: Mutex<HashMap<String, PendingRpc>>,
    streams: Mutex<HashMap<String, StreamListener>>,
    offline_tx: broadcast::Sender<String>,
    verifier: Arc<dyn DeviceTokenVerifier>,
    heartbeat_interval: Duration,
}

impl DeviceChannel {
    pub fn new(verifier: Arc<dyn DeviceTokenVerifier>, heartbeat_interval: Duration) -> Self {
        let (offline_tx, _) = broadcast::channel(32);
        Self {
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            offline_tx,
            verifier,
            heartbeat_interval,
        }
    }

    /// A connection is dead once it has been silent for 1.5x the ping interval.
    fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_interval / 2
    }

    pub async fn is_device_online(&self, device_id: &str) -> bool {
        self.connections.lock().await.contains_key(device_id)
    }

    /// The device currently connected for a user, if any. Used at generation
    /// start to pick between the hosted and daemon-proxied backends.
    pub async fn device_for_user(&self, user_id: &str) -> Option<String> {
        self.connections
            .lock()
            .await
            .iter()
            .find(|(_, conn)| conn.user_id == user_id)
            .map(|(device_id, _)| device_id.clone())
    }

    /// Device-offline notifications, one per disconnect.
    pub fn subscribe_offline(&self) -> broadcast::Receiver<String> {
        self.offline_tx.subscribe()
    }

    /// Fire-and-forget push. `false` means no live connection for the device;
    /// nothing is queued.
    pub async fn send(&self, device_id: &str, message: Value) -> bool {
        let outbox = {
            let conns = self.connections.lock().await;
            match conns.get(device_id) {
                Some(conn) => conn.outbox.clone(),
                None => return false,
            }
        };
        outbox
            .send(Message::Text(message.to_string().into()))
            .await
            .is_ok()
    }

    /// Send a message and await the correlated reply. The message must carry
    /// a unique `id`; at-most-once delivery to the caller — a reply arriving
    /// after timeout is silently dropped.
    pub async fn request(
        &self,
        device_id: &str,
        message: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request_id = message
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(RpcError::MissingCorrelationId)?
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingRpc {
                device_id: device_id.to_string(),
                tx,
            },
        );

        if !self.send(device_id, message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(RpcError::Offline);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Resolver dropped: the connection went away.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Register a chunk consumer for a long-running request. Chunks sharing
    /// the correlation id are forwarded until a `done`/`error` frame arrives,
    /// which is forwarded too and then closes the stream.
    pub async fn open_stream(&self, device_id: &str, correlation_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.streams.lock().await.insert(
            correlation_id.to_string(),
            StreamListener {
                device_id: device_id.to_string(),
                tx,
            },
        );
        rx
    }

    pub async fn close_stream(&self, correlation_id: &str) {
        self.streams.lock().await.remove(correlation_id);
    }

    /// Serve one authenticated daemon socket until it closes. The bearer
    /// token was presented at connection start; an invalid one gets an
    /// explicit error frame before the socket is dropped.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, token: &str) {
        let identity = match self.verifier.verify(token) {
            Some(identity) => identity,
            None => {
                warn!("Device socket rejected: authentication failed");
                let frame = json!({ "type": "error", "message": "authentication failed" });
                let _ = socket.send(Message::Text(frame.to_string().into())).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let DeviceIdentity { device_id, user_id } = identity;
        let conn_id = uuid::Uuid::new_v4().to_string();
        let (mut sink, mut stream) = socket.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<Message>(64);

        tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let replaced = {
            let mut conns = self.connections.lock().await;
            conns
                .insert(
                    device_id.clone(),
                    DeviceConnection {
                        user_id: user_id.clone(),
                        conn_id: conn_id.clone(),
                        outbox: outbox.clone(),
                        last_heartbeat: Instant::now(),
                    },
                )
                .is_some()
        };
        if replaced {
            // Last writer wins: dropping the old outbox closes the old socket.
            info!("Device [{}] reconnected, replacing previous socket", device_id);
        } else {
            info!("Device [{}] connected (user {})", device_id, user_id);
        }

        let _ = outbox
            .send(Message::Text(
                json!({ "type": "auth_ok", "device_id": device_id }).to_string().into(),
            ))
            .await;

        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Text(text)) => self.route_incoming(&device_id, text.as_str()).await,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => self.touch(&device_id).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Device [{}] socket error: {}", device_id, e);
                    break;
                }
            }
        }

        self.disconnect_conn(&device_id, Some(&conn_id)).await;
    }

    /// Route one inbound frame. Unsolicited `ping`/`pong` carry no id and are
    /// handled outside the correlation table; everything else is matched by
    /// id against the chunk-stream registry first, then the pending map.
    pub(crate) async fn route_incoming(&self, device_id: &str, text: &str) {
        self.touch(device_id).await;

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Device [{}] sent unparseable frame ({})", device_id, e);
                return;
            }
        };

        match value.get("type").and_then(|v| v.as_str()) {
            Some("ping") => {
                self.send(device_id, json!({ "type": "pong" })).await;
                return;
            }
            Some("pong") => return,
            _ => {}
        }

        let id = match value.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                debug!("Device [{}] sent frame without id, dropping", device_id);
                return;
            }
        };

        let terminal = matches!(
            value.get("type").and_then(|v| v.as_str()),
            Some("done") | Some("error")
        );

        // Chunk streams take precedence so streamed replies never collide
        // with the unary reply path.
        {
            let mut streams = self.streams.lock().await;
            if let Some(listener) = streams.get(&id) {
                let tx = listener.tx.clone();
                if terminal {
                    streams.remove(&id);
                }
                drop(streams);
                if tx.send(value).await.is_err() {
                    self.streams.lock().await.remove(&id);
                }
                return;
            }
        }

        match self.pending.lock().await.remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(Ok(value));
            }
            None => {
                // Late or unknown reply: at-most-once delivery, drop it.
                debug!("Device [{}] reply for unknown request id {}", device_id, id);
            }
        }
    }

    async fn touch(&self, device_id: &str) {
        if let Some(conn) = self.connections.lock().await.get_mut(device_id) {
            conn.last_heartbeat = Instant::now();
        }
    }

    /// Force-disconnect a device: remove the connection, fail every pending
    /// request addressed to it, close its chunk streams, and notify offline
    /// observers exactly once.
    pub async fn disconnect(&self, device_id: &str) {
        self.disconnect_conn(device_id, None).await;
    }

    async fn disconnect_conn(&self, device_id: &str, only_conn: Option<&str>) {
        let removed = {
            let mut conns = self.connections.lock().await;
            match conns.get(device_id) {
                Some(conn) if only_conn.is_none_or(|id| id == conn.conn_id) => {
                    conns.remove(device_id);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }

        let waiters: Vec<PendingRpc> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.device_id == device_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(RpcError::Disconnected));
        }

        {
            let mut streams = self.streams.lock().await;
            streams.retain(|_, listener| listener.device_id != device_id);
        }

        info!("Device [{}] disconnected", device_id);
        let _ = self.offline_tx.send(device_id.to_string());
    }

    /// One heartbeat pass: disconnect silent connections, ping the rest.
    pub async fn sweep(&self) {
        let timeout = self.heartbeat_timeout();
        let mut dead = Vec::new();
        let mut alive = Vec::new();
        {
            let conns = self.connections.lock().await;
            for (device_id, conn) in conns.iter() {
                if conn.last_heartbeat.elapsed() > timeout {
                    dead.push(device_id.clone());
                } else {
                    alive.push(device_id.clone());
                }
            }
        }

        for device_id in dead {
            warn!("Device [{}] missed heartbeat window, closing", device_id);
            self.disconnect(&device_id).await;
        }
        for device_id in alive {
            self.send(&device_id, json!({ "type": "ping" })).await;
        }
    }

    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        let mut interval = tokio::time::interval(channel.heartbeat_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                channel.sweep().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn connect_for_test(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> mpsc::Receiver<Message> {
        let (outbox, rx) = mpsc::channel(64);
        self.connections.lock().await.insert(
            device_id.to_string(),
            DeviceConnection {
                user_id: user_id.to_string(),
                conn_id: uuid::Uuid::new_v4().to_string(),
                outbox,
                last_heartbeat: Instant::now(),
            },
        );
        rx
    }

    #[cfg(test)]
    pub(crate) async fn age_connection_for_test(&self, device_id: &str, age: Duration) {
        if let Some(conn) = self.connections.lock().await.get_mut(device_id) {
            conn.last_heartbeat = Instant::now() - age;
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
