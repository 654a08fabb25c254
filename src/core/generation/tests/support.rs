use crate::core::credentials::InMemoryCredentialStore;
use crate::core::generation::types::{GenerationEvent, GenerationStatus};
use crate::core::generation::{BackendFactory, GenerationManager, GenerationSettings};
use crate::core::sandbox::{BackendError, ExecOptions, ExecOutput, ExecutionBackend};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};

/// Scripted backend: the test feeds agent stdout through the returned sender
/// and inspects every file the driver writes.
pub struct MockBackend {
    files: Mutex<HashMap<String, String>>,
    stream: Mutex<Option<mpsc::Receiver<Bytes>>>,
    teardowns: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                files: Mutex::new(HashMap::new()),
                stream: Mutex::new(Some(rx)),
                teardowns: AtomicUsize::new(0),
            }),
            tx,
        )
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Poll until the driver writes the file or the deadline passes.
    pub async fn wait_for_file(&self, path: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(contents) = self.files.lock().await.get(path) {
                return Some(contents.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn id(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _command: &str, _options: ExecOptions) -> Result<ExecOutput, BackendError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn execute_streaming(
        &self,
        _command: &str,
        _env: Vec<(String, String)>,
    ) -> Result<mpsc::Receiver<Bytes>, BackendError> {
        self.stream.lock().await.take().ok_or(BackendError::Offline)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BackendError> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), String::from_utf8_lossy(contents).to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.files
            .lock()
            .await
            .get(path)
            .map(|c| c.as_bytes().to_vec())
            .ok_or_else(|| BackendError::Transport(format!("no such file: {}", path)))
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }
}

pub struct MockFactory {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn acquire(&self, _user_id: &str) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
        Ok(self.backend.clone())
    }
}

pub struct FailingFactory;

#[async_trait]
impl BackendFactory for FailingFactory {
    async fn acquire(&self, _user_id: &str) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
        Err(BackendError::Offline)
    }
}

pub struct Harness {
    pub manager: Arc<GenerationManager>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub backend: Arc<MockBackend>,
    pub agent: mpsc::Sender<Bytes>,
}

pub fn fast_settings() -> GenerationSettings {
    GenerationSettings {
        approval_timeout: Duration::from_secs(5),
        auth_timeout: Duration::from_secs(5),
        ..GenerationSettings::default()
    }
}

pub fn harness(settings: GenerationSettings) -> Harness {
    let credentials = Arc::new(InMemoryCredentialStore::new());
    let (backend, agent) = MockBackend::new();
    let manager = GenerationManager::new(
        credentials.clone(),
        Arc::new(MockFactory { backend: backend.clone() }),
        settings,
    );
    Harness {
        manager,
        credentials,
        backend,
        agent,
    }
}

pub async fn feed_line(agent: &mpsc::Sender<Bytes>, line: &str) {
    agent
        .send(Bytes::from(format!("{}\n", line)))
        .await
        .expect("agent stream closed");
}

pub async fn next_event(rx: &mut broadcast::Receiver<GenerationEvent>) -> GenerationEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a generation event")
        .expect("event channel closed")
}

pub async fn wait_for_status(
    manager: &Arc<GenerationManager>,
    generation_id: &str,
    status: GenerationStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if manager.status(generation_id).await == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for status {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
