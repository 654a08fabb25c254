pub mod driver;
pub mod parser;
pub mod types;

#[cfg(test)]
mod tests;

use crate::core::credentials::CredentialStore;
use crate::core::device::DeviceChannel;
use crate::core::permissions::PermissionPolicy;
use crate::core::sandbox::device::DeviceSandbox;
use crate::core::sandbox::hosted::HostedSandbox;
use crate::core::sandbox::{BackendError, ExecutionBackend};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::{
    ApprovalDecision, ApprovalRequest, AuthOutcome, AuthRequest, Generation, GenerationEvent,
    GenerationStatus, StartOptions, can_transition, now_unix_ms,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("generation not found")]
    NotFound,
    #[error("generation belongs to another user")]
    Forbidden,
    #[error("conversation already has an active generation")]
    ConversationBusy,
}

/// Picks where a generation's commands run. Split out as a trait so the
/// orchestrator can be exercised without a sandbox provider or a daemon.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn acquire(&self, user_id: &str) -> Result<Arc<dyn ExecutionBackend>, BackendError>;
}

/// Production routing: the user's own machine when its daemon is connected,
/// a hosted sandbox otherwise.
pub struct DefaultBackendFactory {
    devices: Arc<DeviceChannel>,
    provider_url: String,
    api_key: String,
    exec_timeout: Duration,
}

impl DefaultBackendFactory {
    pub fn new(
        devices: Arc<DeviceChannel>,
        provider_url: &str,
        api_key: &str,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            devices,
            provider_url: provider_url.to_string(),
            api_key: api_key.to_string(),
            exec_timeout,
        }
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn acquire(&self, user_id: &str) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
        if let Some(device_id) = self.devices.device_for_user(user_id).await {
            debug!("Routing generation to device [{}]", device_id);
            return Ok(Arc::new(DeviceSandbox::new(
                self.devices.clone(),
                &device_id,
                self.exec_timeout,
            )));
        }
        let sandbox =
            HostedSandbox::create(&self.provider_url, &self.api_key, self.exec_timeout).await?;
        Ok(Arc::new(sandbox))
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub approval_timeout: Duration,
    pub auth_timeout: Duration,
    pub policy: PermissionPolicy,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(300),
            auth_timeout: Duration::from_secs(600),
            policy: PermissionPolicy::default(),
        }
    }
}

struct PendingApproval {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalDecision>,
}

struct PendingAuth {
    request: AuthRequest,
    tx: oneshot::Sender<AuthOutcome>,
}

/// Owns the generation lifecycle: one record per AI turn, a broadcast event
/// channel per generation, and the suspension machinery for approvals and
/// auth. All mutation funnels through status transitions validated by
/// [`can_transition`].
///
/// Registry locks nest in declaration order: `generations` first, then
/// `current_by_conversation`, then `events`.
pub struct GenerationManager {
    generations: Mutex<HashMap<String, Generation>>,
    current_by_conversation: Mutex<HashMap<String, String>>,
    events: Mutex<HashMap<String, broadcast::Sender<GenerationEvent>>>,
    pending_approvals: Mutex<HashMap<String, PendingApproval>>,
    pending_auths: Mutex<HashMap<String, PendingAuth>>,
    backends: Mutex<HashMap<String, Arc<dyn ExecutionBackend>>>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn BackendFactory>,
    settings: GenerationSettings,
}

impl GenerationManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn BackendFactory>,
        settings: GenerationSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            generations: Mutex::new(HashMap::new()),
            current_by_conversation: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            pending_approvals: Mutex::new(HashMap::new()),
            pending_auths: Mutex::new(HashMap::new()),
            backends: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            credentials,
            factory,
            settings,
        })
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Start a generation for a conversation and return its id immediately;
    /// the agent runs on a spawned driver task. One active generation per
    /// conversation.
    pub async fn start(
        self: &Arc<Self>,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        options: StartOptions,
    ) -> Result<String, OrchestratorError> {
        let generation_id = uuid::Uuid::new_v4().to_string();

        {
            let generations = self.generations.lock().await;
            let mut current = self.current_by_conversation.lock().await;
            if let Some(existing) = current.get(conversation_id) {
                if let Some(generation) = generations.get(existing) {
                    if !generation.status.is_terminal() {
                        return Err(OrchestratorError::ConversationBusy);
                    }
                }
            }
            current.insert(conversation_id.to_string(), generation_id.clone());
        }

        let generation = Generation {
            id: generation_id.clone(),
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            status: GenerationStatus::Running,
            sandbox_id: None,
            allowed_integrations: options
                .allowed_integrations
                .map(|list| list.into_iter().collect()),
            auto_approve: options.auto_approve,
            created_at_ms: now_unix_ms(),
            completed_at_ms: None,
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.generations
            .lock()
            .await
            .insert(generation_id.clone(), generation);
        self.events.lock().await.insert(generation_id.clone(), event_tx);
        self.cancel_tokens
            .lock()
            .await
            .insert(generation_id.clone(), CancellationToken::new());

        info!(
            "Generation [{}] started for conversation [{}]",
            generation_id, conversation_id
        );

        let manager = self.clone();
        let id = generation_id.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            driver::drive(manager, id, content).await;
        });

        Ok(generation_id)
    }

    pub async fn generation(&self, generation_id: &str) -> Option<Generation> {
        self.generations.lock().await.get(generation_id).cloned()
    }

    pub async fn status(&self, generation_id: &str) -> Option<GenerationStatus> {
        self.generations
            .lock()
            .await
            .get(generation_id)
            .map(|g| g.status)
    }

    /// Most recent generation for a conversation, terminal or not.
    pub async fn generation_for_conversation(&self, conversation_id: &str) -> Option<Generation> {
        let id = self
            .current_by_conversation
            .lock()
            .await
            .get(conversation_id)
            .cloned()?;
        self.generation(&id).await
    }

    /// Allow-list bound to a conversation's current generation. `None` means
    /// unrestricted (or no generation at all).
    pub async fn allowed_integrations_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Option<HashSet<String>> {
        self.generation_for_conversation(conversation_id)
            .await?
            .allowed_integrations
    }

    /// Subscribe to a generation's event stream. Returns the status at
    /// subscription time so callers can synthesize the terminal event for
    /// generations that already finished.
    pub async fn subscribe(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> Result<(GenerationStatus, broadcast::Receiver<GenerationEvent>), OrchestratorError> {
        // The generations lock is held across the subscription; a terminal
        // transition cannot slip between the status snapshot and subscribe(),
        // since finish() mutates the status under the same lock.
        let generations = self.generations.lock().await;
        let generation = generations.get(generation_id).ok_or(OrchestratorError::NotFound)?;
        if generation.user_id != user_id {
            return Err(OrchestratorError::Forbidden);
        }
        let status = generation.status;
        let events = self.events.lock().await;
        let tx = events.get(generation_id).ok_or(OrchestratorError::NotFound)?;
        Ok((status, tx.subscribe()))
    }

    pub async fn pending_approval(&self, generation_id: &str) -> Option<ApprovalRequest> {
        self.pending_approvals
            .lock()
            .await
            .get(generation_id)
            .map(|p| p.request.clone())
    }

    pub async fn pending_auth(&self, generation_id: &str) -> Option<AuthRequest> {
        self.pending_auths
            .lock()
            .await
            .get(generation_id)
            .map(|p| p.request.clone())
    }

    pub(crate) fn factory(&self) -> &Arc<dyn BackendFactory> {
        &self.factory
    }

    pub(crate) async fn attach_backend(
        &self,
        generation_id: &str,
        backend: Arc<dyn ExecutionBackend>,
    ) {
        if let Some(generation) = self.generations.lock().await.get_mut(generation_id) {
            generation.sandbox_id = Some(backend.id().to_string());
        }
        self.backends
            .lock()
            .await
            .insert(generation_id.to_string(), backend);
    }

    pub(crate) async fn cancel_token(&self, generation_id: &str) -> Option<CancellationToken> {
        self.cancel_tokens.lock().await.get(generation_id).cloned()
    }

    /// Apply a status transition. Invalid moves are logged and refused, never
    /// applied; terminal states are immutable.
    pub(crate) async fn set_status(&self, generation_id: &str, to: GenerationStatus) -> bool {
        let mut generations = self.generations.lock().await;
        let Some(generation) = generations.get_mut(generation_id) else {
            return false;
        };
        if !can_transition(generation.status, to) {
            warn!(
                "Generation [{}] refused transition {} -> {}",
                generation_id,
                generation.status.as_str(),
                to.as_str()
            );
            return false;
        }
        generation.status = to;
        if to.is_terminal() {
            generation.completed_at_ms = Some(now_unix_ms());
        }
        true
    }

    pub(crate) async fn emit(&self, generation_id: &str, event: GenerationEvent) {
        if let Some(tx) = self.events.lock().await.get(generation_id) {
            // No subscribers yet is fine; events before the first subscriber
            // are dropped by design of the broadcast channel.
            let _ = tx.send(event);
        }
    }

    /// Suspend the driver until the user resolves an approval, a timeout
    /// fires, or the generation is cancelled. Timeout and cancellation both
    /// resolve to Deny.
    pub(crate) async fn wait_for_approval(
        &self,
        generation_id: &str,
        request: ApprovalRequest,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_approvals.lock().await;
            if pending.contains_key(generation_id) {
                // The driver serializes tool calls, so a second pending
                // approval is a bug upstream. Refuse it.
                warn!(
                    "Generation [{}] already has a pending approval, denying",
                    generation_id
                );
                return ApprovalDecision::Deny;
            }
            pending.insert(generation_id.to_string(), PendingApproval { request: request.clone(), tx });
        }

        if !self.set_status(generation_id, GenerationStatus::AwaitingApproval).await {
            self.pending_approvals.lock().await.remove(generation_id);
            return ApprovalDecision::Deny;
        }
        self.emit(
            generation_id,
            GenerationEvent::ApprovalNeeded {
                integration: request.integration.clone(),
                operation: request.operation.clone(),
                command: request.command.clone(),
            },
        )
        .await;

        let token = self.cancel_token(generation_id).await.unwrap_or_default();
        let decision = tokio::select! {
            outcome = tokio::time::timeout(self.settings.approval_timeout, rx) => match outcome {
                Ok(Ok(decision)) => decision,
                // Sender dropped: cancellation cleared the pending entry.
                Ok(Err(_)) => ApprovalDecision::Deny,
                Err(_) => {
                    warn!("Generation [{}] approval timed out, denying", generation_id);
                    self.pending_approvals.lock().await.remove(generation_id);
                    ApprovalDecision::Deny
                }
            },
            _ = token.cancelled() => ApprovalDecision::Deny,
        };

        // Resume; a no-op if the generation reached a terminal state while
        // suspended.
        self.set_status(generation_id, GenerationStatus::Running).await;
        decision
    }

    /// Resolve a pending approval. Resolving when nothing is pending is a
    /// no-op so retried requests stay idempotent.
    pub async fn resolve_approval(
        &self,
        generation_id: &str,
        user_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), OrchestratorError> {
        self.authorize(generation_id, user_id).await?;
        if let Some(pending) = self.pending_approvals.lock().await.remove(generation_id) {
            info!(
                "Generation [{}] approval resolved: {:?}",
                generation_id, decision
            );
            let _ = pending.tx.send(decision);
        }
        Ok(())
    }

    /// Suspend the driver until credentials arrive for a missing integration.
    /// Timeout and cancellation resolve to Failed.
    pub(crate) async fn wait_for_auth(
        &self,
        generation_id: &str,
        request: AuthRequest,
    ) -> AuthOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_auths.lock().await;
            if pending.contains_key(generation_id) {
                warn!(
                    "Generation [{}] already has a pending auth request, failing",
                    generation_id
                );
                return AuthOutcome::Failed;
            }
            pending.insert(generation_id.to_string(), PendingAuth { request: request.clone(), tx });
        }

        if !self.set_status(generation_id, GenerationStatus::AwaitingAuth).await {
            self.pending_auths.lock().await.remove(generation_id);
            return AuthOutcome::Failed;
        }
        self.emit(
            generation_id,
            GenerationEvent::AuthNeeded {
                integration: request.integration.clone(),
                reason: request.reason.clone(),
            },
        )
        .await;

        let token = self.cancel_token(generation_id).await.unwrap_or_default();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.settings.auth_timeout, rx) => match outcome {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => AuthOutcome::Failed,
                Err(_) => {
                    warn!("Generation [{}] auth wait timed out", generation_id);
                    self.pending_auths.lock().await.remove(generation_id);
                    AuthOutcome::Failed
                }
            },
            _ = token.cancelled() => AuthOutcome::Failed,
        };

        self.set_status(generation_id, GenerationStatus::Running).await;
        outcome
    }

    /// Complete a pending auth flow. A success stores the tokens before the
    /// driver resumes, so the re-checked permission sees the integration as
    /// connected.
    pub async fn resolve_auth(
        &self,
        generation_id: &str,
        user_id: &str,
        integration: &str,
        outcome: AuthOutcome,
    ) -> Result<(), OrchestratorError> {
        self.authorize(generation_id, user_id).await?;

        let pending = {
            let mut pending = self.pending_auths.lock().await;
            match pending.get(generation_id) {
                Some(p) if p.request.integration == integration => {
                    pending.remove(generation_id)
                }
                Some(p) => {
                    warn!(
                        "Generation [{}] auth result for {} but {} is pending, ignoring",
                        generation_id, integration, p.request.integration
                    );
                    None
                }
                None => None,
            }
        };

        if let Some(pending) = pending {
            if let AuthOutcome::Success { tokens } = &outcome {
                self.credentials
                    .store_tokens(user_id, integration, tokens.clone())
                    .await;
            }
            info!(
                "Generation [{}] auth for {} resolved: {}",
                generation_id,
                integration,
                if matches!(outcome, AuthOutcome::Success { .. }) { "success" } else { "failed" }
            );
            let _ = pending.tx.send(outcome);
        }
        Ok(())
    }

    /// Cancel a generation. Idempotent: cancelling a terminal generation is
    /// a successful no-op. Pending approval and auth waiters are woken, the
    /// driver's token fires, and the sandbox is torn down in the background.
    pub async fn cancel(&self, generation_id: &str, user_id: &str) -> Result<(), OrchestratorError> {
        self.authorize(generation_id, user_id).await?;

        if !self
            .finish(generation_id, GenerationStatus::Cancelled, GenerationEvent::Cancelled)
            .await
        {
            return Ok(());
        }

        if let Some(token) = self.cancel_token(generation_id).await {
            token.cancel();
        }
        // Dropping the senders wakes any suspended wait with a closed-channel
        // result, which maps to Deny / Failed.
        self.pending_approvals.lock().await.remove(generation_id);
        self.pending_auths.lock().await.remove(generation_id);
        Ok(())
    }

    /// Move a generation to a terminal state exactly once: set the status,
    /// emit the terminal event, release the sandbox. Returns false when the
    /// generation was already terminal.
    pub(crate) async fn finish(
        &self,
        generation_id: &str,
        status: GenerationStatus,
        event: GenerationEvent,
    ) -> bool {
        {
            let mut generations = self.generations.lock().await;
            let Some(generation) = generations.get_mut(generation_id) else {
                return false;
            };
            if generation.status.is_terminal() || !can_transition(generation.status, status) {
                return false;
            }
            generation.status = status;
            generation.completed_at_ms = Some(now_unix_ms());
        }

        info!("Generation [{}] finished: {}", generation_id, status.as_str());
        self.emit(generation_id, event).await;

        if let Some(backend) = self.backends.lock().await.remove(generation_id) {
            let id = generation_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = backend.teardown().await {
                    warn!("Generation [{}] sandbox teardown failed: {}", id, e);
                }
            });
        }
        true
    }

    pub(crate) async fn fail(&self, generation_id: &str, message: &str) {
        warn!("Generation [{}] failed: {}", generation_id, message);
        self.finish(
            generation_id,
            GenerationStatus::Error,
            GenerationEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
    }

    /// Drop terminal generations older than the retention window, along with
    /// their event channels and conversation bindings.
    pub async fn gc_terminated(&self, retention: Duration) {
        let cutoff = now_unix_ms().saturating_sub(retention.as_millis() as u64);
        let expired: Vec<(String, String)> = {
            let generations = self.generations.lock().await;
            generations
                .values()
                .filter(|g| {
                    g.status.is_terminal() && g.completed_at_ms.is_some_and(|t| t < cutoff)
                })
                .map(|g| (g.id.clone(), g.conversation_id.clone()))
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        debug!("Garbage collecting {} terminal generation(s)", expired.len());
        let mut generations = self.generations.lock().await;
        let mut current = self.current_by_conversation.lock().await;
        let mut events = self.events.lock().await;
        let mut tokens = self.cancel_tokens.lock().await;
        for (id, conversation_id) in expired {
            generations.remove(&id);
            events.remove(&id);
            tokens.remove(&id);
            if current.get(&conversation_id) == Some(&id) {
                current.remove(&conversation_id);
            }
        }
    }

    async fn authorize(&self, generation_id: &str, user_id: &str) -> Result<(), OrchestratorError> {
        let generations = self.generations.lock().await;
        let generation = generations.get(generation_id).ok_or(OrchestratorError::NotFound)?;
        if generation.user_id != user_id {
            return Err(OrchestratorError::Forbidden);
        }
        Ok(())
    }
}
