pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::core::device::DeviceChannel;
use crate::core::generation::GenerationManager;
use crate::core::lifecycle::LifecycleComponent;

pub struct ApiServer {
    generations: Arc<GenerationManager>,
    devices: Arc<DeviceChannel>,
    log_tx: tokio::sync::broadcast::Sender<String>,
    api_host: String,
    api_port: u16,
    api_token: String,
    internal_token: String,
}

pub struct ApiServerConfig {
    pub generations: Arc<GenerationManager>,
    pub devices: Arc<DeviceChannel>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub api_token: String,
    pub internal_token: String,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) generations: Arc<GenerationManager>,
    pub(crate) devices: Arc<DeviceChannel>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: String,
    pub(crate) internal_token: String,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            generations: config.generations,
            devices: config.devices,
            log_tx: config.log_tx,
            api_host: config.api_host,
            api_port: config.api_port,
            api_token: config.api_token,
            internal_token: config.internal_token,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream)
}

// --- Lifecycle Implementation ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let generations = self.generations.clone();
        let devices = self.devices.clone();
        let log_tx = self.log_tx.clone();
        let api_host = self.api_host.clone();
        let api_port = self.api_port;
        let api_token = self.api_token.clone();
        let internal_token = self.internal_token.clone();

        tokio::spawn(async move {
            let addr = format!("{}:{}", api_host, api_port);
            let state = AppState {
                generations,
                devices,
                log_tx,
                api_host,
                api_port,
                api_token,
                internal_token,
            };
            let app = router::build_api_router(state);

            if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
                info!("API Server running at http://{addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("API Server crashed: {}", e);
                }
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        Ok(())
    }
}
