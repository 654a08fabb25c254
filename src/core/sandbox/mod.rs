pub mod device;
pub mod hosted;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport failures between steward and a sandbox. A command that ran and
/// exited non-zero is not an error; that lives in [`ExecOutput::exit_code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("sandbox backend is offline")]
    Offline,
    #[error("sandbox operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("sandbox transport failed: {0}")]
    Transport(String),
    #[error("sandbox returned a malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

/// Completed command result, captured in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Where a generation's commands actually run. Implementations differ only in
/// transport: a hosted sandbox provider over HTTP, or the user's own machine
/// proxied through the device channel.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Stable identifier for logs and the generation record.
    fn id(&self) -> &str;

    /// Run a command to completion and capture its output.
    async fn execute(&self, command: &str, options: ExecOptions) -> Result<ExecOutput, BackendError>;

    /// Run a long-lived command and stream its stdout as raw chunks. The
    /// channel closes when the process exits or the transport drops.
    async fn execute_streaming(
        &self,
        command: &str,
        env: Vec<(String, String)>,
    ) -> Result<mpsc::Receiver<Bytes>, BackendError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BackendError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BackendError>;

    /// Release the sandbox. Idempotent; a second teardown is a no-op.
    async fn teardown(&self) -> Result<(), BackendError>;

    async fn is_available(&self) -> bool;
}
