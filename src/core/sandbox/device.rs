use super::{BackendError, ExecOptions, ExecOutput, ExecutionBackend};
use crate::core::device::{DeviceChannel, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FILE_OP_TIMEOUT: Duration = Duration::from_secs(15);

/// Sandbox proxied to the user's own machine through the daemon socket.
/// Every operation is one correlated RPC; streamed exec rides a chunk stream.
pub struct DeviceSandbox {
    channel: Arc<DeviceChannel>,
    device_id: String,
    backend_id: String,
    exec_timeout: Duration,
}

impl DeviceSandbox {
    pub fn new(channel: Arc<DeviceChannel>, device_id: &str, exec_timeout: Duration) -> Self {
        Self {
            channel,
            backend_id: format!("device:{}", device_id),
            device_id: device_id.to_string(),
            exec_timeout,
        }
    }
}

impl From<RpcError> for BackendError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Offline | RpcError::Disconnected => BackendError::Offline,
            RpcError::Timeout(d) => BackendError::Timeout(d),
            RpcError::MissingCorrelationId => BackendError::Transport(e.to_string()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for DeviceSandbox {
    fn id(&self) -> &str {
        &self.backend_id
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<ExecOutput, BackendError> {
        let timeout = options.timeout.unwrap_or(self.exec_timeout);
        let env: serde_json::Map<String, serde_json::Value> = options
            .env
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        let reply = self
            .channel
            .request(
                &self.device_id,
                json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "exec",
                    "command": command,
                    "env": env,
                    "timeout_secs": timeout.as_secs(),
                }),
                timeout,
            )
            .await?;

        let exit_code = reply
            .get("exit_code")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                BackendError::MalformedResponse("exec reply missing exit_code".to_string())
            })?;
        Ok(ExecOutput {
            exit_code: exit_code as i32,
            stdout: reply
                .get("stdout")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stderr: reply
                .get("stderr")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn execute_streaming(
        &self,
        command: &str,
        env: Vec<(String, String)>,
    ) -> Result<mpsc::Receiver<Bytes>, BackendError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let env: serde_json::Map<String, serde_json::Value> = env
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        // Register the listener before sending so no early chunk is lost.
        let mut frames = self.channel.open_stream(&self.device_id, &correlation_id).await;

        let sent = self
            .channel
            .send(
                &self.device_id,
                json!({
                    "id": correlation_id,
                    "type": "exec_stream",
                    "command": command,
                    "env": env,
                }),
            )
            .await;
        if !sent {
            self.channel.close_stream(&correlation_id).await;
            return Err(BackendError::Offline);
        }

        let (tx, rx) = mpsc::channel(64);
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame.get("type").and_then(|v| v.as_str()) {
                    Some("chunk") => {
                        let data = frame.get("data").and_then(|v| v.as_str()).unwrap_or_default();
                        if tx.send(Bytes::from(data.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some("done") => break,
                    Some("error") => {
                        let message = frame
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown");
                        warn!("Device [{}] stream exec failed: {}", device_id, message);
                        break;
                    }
                    other => debug!("Device [{}] unexpected stream frame: {:?}", device_id, other),
                }
            }
        });

        Ok(rx)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BackendError> {
        self.channel
            .request(
                &self.device_id,
                json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "fs_write",
                    "path": path,
                    // Device-side files here are JSON or text payloads.
                    "contents": String::from_utf8_lossy(contents),
                }),
                FILE_OP_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        let reply = self
            .channel
            .request(
                &self.device_id,
                json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "fs_read",
                    "path": path,
                }),
                FILE_OP_TIMEOUT,
            )
            .await?;

        let contents = reply
            .get("contents")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BackendError::MalformedResponse("fs_read reply missing contents".to_string())
            })?;
        Ok(contents.as_bytes().to_vec())
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        // The workspace lives on the user's machine; teardown only asks the
        // daemon to clean scratch state and is best-effort by contract.
        match self
            .channel
            .request(
                &self.device_id,
                json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "teardown",
                }),
                FILE_OP_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(RpcError::Offline) | Err(RpcError::Disconnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_available(&self) -> bool {
        self.channel.is_device_online(&self.device_id).await
    }
}
