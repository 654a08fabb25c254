use anyhow::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StewardConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub approvals: ApprovalConfig,

    #[serde(default)]
    pub permissions: PermissionConfig,

    #[serde(default)]
    pub generations: GenerationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token clients present. Empty means loopback-only open access.
    #[serde(default)]
    pub api_token: String,

    /// Token for same-process internal calls; generated fresh per boot when
    /// absent from the config file.
    #[serde(default = "generate_internal_token")]
    pub internal_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_provider_url")]
    pub provider_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// token -> "device_id:user_id"
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionConfig {
    /// When a known CLI presents a verb outside the read/write tables, ask
    /// for approval instead of failing.
    #[serde(default = "default_true")]
    pub allow_unknown_operations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// How long terminal generations stay queryable before garbage collection.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4270
}
fn default_provider_url() -> String {
    "https://sandboxes.steward.sh".to_string()
}
fn default_exec_timeout() -> u64 {
    600
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_approval_timeout() -> u64 {
    300
}
fn default_auth_timeout() -> u64 {
    600
}
fn default_retention() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

fn generate_internal_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: String::new(),
            internal_token: generate_internal_token(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider_url: default_provider_url(),
            api_key: String::new(),
            exec_timeout_secs: default_exec_timeout(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            tokens: HashMap::new(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            allow_unknown_operations: default_true(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
        }
    }
}

impl StewardConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("steward")
            .join("steward.toml")
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No steward.toml found at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: StewardConfig = toml::from_str(&content)?;
        info!(
            "Loaded config: api={}:{}, sandbox provider={}, {} device token(s)",
            config.api.host,
            config.api.port,
            config.sandbox.provider_url,
            config.devices.tokens.len()
        );
        Ok(config)
    }

    /// Device token table in verifier form: token -> (device_id, user_id).
    /// Malformed entries are skipped.
    pub fn device_identities(&self) -> HashMap<String, crate::core::device::DeviceIdentity> {
        self.devices
            .tokens
            .iter()
            .filter_map(|(token, target)| {
                let (device_id, user_id) = target.split_once(':')?;
                Some((
                    token.clone(),
                    crate::core::device::DeviceIdentity {
                        device_id: device_id.to_string(),
                        user_id: user_id.to_string(),
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StewardConfig::default();
        assert_eq!(config.api.port, 4270);
        assert!(config.api.api_token.is_empty());
        assert!(!config.api.internal_token.is_empty());
        assert_eq!(config.approvals.timeout_secs, 300);
        assert_eq!(config.approvals.auth_timeout_secs, 600);
        assert!(config.permissions.allow_unknown_operations);
        assert_eq!(config.generations.retention_secs, 3600);
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = StewardConfig::load(tmpdir.path().join("steward.toml"))
            .await
            .unwrap();
        assert_eq!(config.api.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn load_parses_partial_config() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("steward.toml");
        std::fs::write(
            &path,
            r#"
[api]
port = 9000
api_token = "secret"

[devices]
heartbeat_interval_secs = 5

[devices.tokens]
"tok-1" = "laptop:u1"
"bad-entry" = "no-colon"

[permissions]
allow_unknown_operations = false
"#,
        )
        .unwrap();

        let config = StewardConfig::load(&path).await.unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.api_token, "secret");
        assert_eq!(config.devices.heartbeat_interval_secs, 5);
        assert!(!config.permissions.allow_unknown_operations);
        // Untouched sections keep defaults.
        assert_eq!(config.sandbox.exec_timeout_secs, 600);

        let identities = config.device_identities();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities["tok-1"].device_id, "laptop");
        assert_eq!(identities["tok-1"].user_id, "u1");
    }

    #[test]
    fn internal_token_is_generated_when_absent() {
        let config: StewardConfig = toml::from_str("").unwrap();
        assert_eq!(config.api.internal_token.len(), 48);
    }
}
