use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::core::config::StewardConfig;
use crate::core::credentials::InMemoryCredentialStore;
use crate::core::device::{DeviceChannel, StaticTokenVerifier};
use crate::core::generation::{DefaultBackendFactory, GenerationManager, GenerationSettings};
use crate::core::lifecycle::LifecycleManager;
use crate::core::permissions::PermissionPolicy;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::LogTeeMakeWriter;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Run the steward daemon in the foreground")
        .print();

    GuideSection::new("Diagnostics")
        .command("version", "Print the installed version")
        .command("help", "Show this help")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        console::style("Usage:").bold(),
        console::style("steward").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServeFlags {
    pub config_path: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> ServeFlags {
    let mut flags = ServeFlags {
        config_path: None,
        api_host: None,
        api_port: None,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    flags.api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-port" => {
                if i + 1 < args.len() {
                    flags.api_port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    flags
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => return serve(&args).await,
            "version" | "--version" | "-V" => {
                println!("steward {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                print_error(&format!("Unknown command: {}", other));
                print_help();
                return Ok(());
            }
        }
    }

    print_help();
    Ok(())
}

async fn serve(args: &[String]) -> Result<()> {
    terminal::print_banner();

    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    let make_writer = LogTeeMakeWriter::new(log_tx.clone());

    // Initialize standard structured logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let flags = parse_serve_flags(args, 2);
    let config_path = flags
        .config_path
        .unwrap_or_else(StewardConfig::default_path);
    let mut config = StewardConfig::load(&config_path).await?;
    if let Some(host) = flags.api_host {
        config.api.host = host;
    }
    if let Some(port) = flags.api_port {
        config.api.port = port;
    }

    info!("Starting steward daemon...");

    let verifier = Arc::new(StaticTokenVerifier::new(config.device_identities()));
    let devices = Arc::new(DeviceChannel::new(
        verifier,
        Duration::from_secs(config.devices.heartbeat_interval_secs),
    ));
    let credentials = Arc::new(InMemoryCredentialStore::new());
    let factory = Arc::new(DefaultBackendFactory::new(
        devices.clone(),
        &config.sandbox.provider_url,
        &config.sandbox.api_key,
        Duration::from_secs(config.sandbox.exec_timeout_secs),
    ));
    let settings = GenerationSettings {
        approval_timeout: Duration::from_secs(config.approvals.timeout_secs),
        auth_timeout: Duration::from_secs(config.approvals.auth_timeout_secs),
        policy: PermissionPolicy {
            allow_unknown_operations: config.permissions.allow_unknown_operations,
        },
    };
    let generations = GenerationManager::new(credentials, factory, settings);

    devices.spawn_heartbeat();
    {
        let generations = generations.clone();
        let retention = Duration::from_secs(config.generations.retention_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                generations.gc_terminated(retention).await;
            }
        });
    }

    let api = ApiServer::new(ApiServerConfig {
        generations,
        devices,
        log_tx,
        api_host: config.api.host.clone(),
        api_port: config.api.port,
        api_token: config.api.api_token.clone(),
        internal_token: config.api.internal_token.clone(),
    });

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(tokio::sync::Mutex::new(api)));
    lifecycle.start().await?;

    terminal::print_success("steward is running.");
    terminal::print_link(
        "API",
        &format!("http://{}:{}", config.api.host, config.api.port),
    );
    terminal::print_status("Devices", "connect daemons at /api/devices/ws");
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_flags_reads_all_flags() {
        let args = vec![
            "steward".to_string(),
            "serve".to_string(),
            "--config".to_string(),
            "/etc/steward.toml".to_string(),
            "--api-host".to_string(),
            "0.0.0.0".to_string(),
            "--api-port".to_string(),
            "9000".to_string(),
        ];
        let flags = parse_serve_flags(&args, 2);
        assert_eq!(flags.config_path, Some(PathBuf::from("/etc/steward.toml")));
        assert_eq!(flags.api_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.api_port, Some(9000));
    }

    #[test]
    fn parse_serve_flags_defaults_to_none() {
        let args = vec!["steward".to_string(), "serve".to_string()];
        let flags = parse_serve_flags(&args, 2);
        assert_eq!(flags.config_path, None);
        assert_eq!(flags.api_host, None);
        assert_eq!(flags.api_port, None);
    }

    #[test]
    fn parse_serve_flags_ignores_dangling_values() {
        let args = vec![
            "steward".to_string(),
            "serve".to_string(),
            "--api-port".to_string(),
        ];
        let flags = parse_serve_flags(&args, 2);
        assert_eq!(flags.api_port, None);
    }

    #[test]
    fn parse_serve_flags_tolerates_unknown_flags() {
        let args = vec![
            "steward".to_string(),
            "serve".to_string(),
            "--verbose".to_string(),
            "--api-port".to_string(),
            "8123".to_string(),
        ];
        let flags = parse_serve_flags(&args, 2);
        assert_eq!(flags.api_port, Some(8123));
    }
}
