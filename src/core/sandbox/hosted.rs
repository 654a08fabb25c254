use super::{BackendError, ExecOptions, ExecOutput, ExecutionBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FILE_OP_TIMEOUT: Duration = Duration::from_secs(15);

/// Sandbox hosted by the provider's HTTP API. One instance per generation;
/// the sandbox is created on demand and torn down when the generation ends.
pub struct HostedSandbox {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sandbox_id: String,
    exec_timeout: Duration,
}

impl HostedSandbox {
    /// Provision a fresh sandbox from the provider.
    pub async fn create(
        base_url: &str,
        api_key: &str,
        exec_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/sandboxes", base_url))
            .bearer_auth(api_key)
            .json(&json!({}))
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let body = check_status(response).await?;
        let sandbox_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::MalformedResponse("create response missing id".to_string()))?
            .to_string();
        debug!("Provisioned hosted sandbox [{}]", sandbox_id);

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            sandbox_id,
            exec_timeout,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v1/sandboxes/{}{}", self.base_url, self.sandbox_id, suffix)
    }
}

#[async_trait]
impl ExecutionBackend for HostedSandbox {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<ExecOutput, BackendError> {
        let timeout = options.timeout.unwrap_or(self.exec_timeout);
        let env: Value = options
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let response = self
            .client
            .post(self.url("/exec"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "command": command,
                "env": env,
                "timeout_secs": timeout.as_secs(),
            }))
            // Leave the provider headroom to report its own timeout first.
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let body = check_status(response).await?;
        parse_exec_output(&body)
    }

    async fn execute_streaming(
        &self,
        command: &str,
        env: Vec<(String, String)>,
    ) -> Result<mpsc::Receiver<Bytes>, BackendError> {
        let env: Value = env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let response = self
            .client
            .post(self.url("/exec/stream"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "command": command, "env": env }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "stream exec rejected with status {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let sandbox_id = self.sandbox_id.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Hosted sandbox [{}] stream broke: {}", sandbox_id, e);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BackendError> {
        let response = self
            .client
            .put(self.url("/files"))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .body(contents.to_vec())
            .timeout(FILE_OP_TIMEOUT)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "file write rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .get(self.url("/files"))
            .bearer_auth(&self.api_key)
            .query(&[("path", path)])
            .timeout(FILE_OP_TIMEOUT)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "file read rejected with status {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(bytes.to_vec())
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url(""))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        // A sandbox that is already gone counts as torn down.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BackendError::Transport(format!(
                "teardown rejected with status {}",
                response.status()
            )))
        }
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(self.url(""))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(Duration::ZERO)
    } else if e.is_connect() {
        BackendError::Offline
    } else {
        BackendError::Transport(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<Value, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Transport(format!(
            "provider returned status {}: {}",
            status, body
        )));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))
}

fn parse_exec_output(body: &Value) -> Result<ExecOutput, BackendError> {
    let exit_code = body
        .get("exit_code")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| BackendError::MalformedResponse("exec response missing exit_code".to_string()))?;
    Ok(ExecOutput {
        exit_code: exit_code as i32,
        stdout: body
            .get("stdout")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        stderr: body
            .get("stderr")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_parses_full_response() {
        let body = json!({ "exit_code": 2, "stdout": "out", "stderr": "err" });
        let output = parse_exec_output(&body).unwrap();
        assert_eq!(output.exit_code, 2);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[test]
    fn exec_output_defaults_missing_streams() {
        let body = json!({ "exit_code": 0 });
        let output = parse_exec_output(&body).unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.is_empty());
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn exec_output_without_exit_code_is_malformed() {
        let body = json!({ "stdout": "out" });
        assert!(matches!(
            parse_exec_output(&body),
            Err(BackendError::MalformedResponse(_))
        ));
    }
}
