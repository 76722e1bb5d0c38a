use anyhow::{anyhow, Result};
use chrono::FixedOffset;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Access file and expiry sweep settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_file")]
    pub file: PathBuf,
    /// Fixed offset used for timestamps in the access file (+330 = UTC+05:30)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_auth_file() -> PathBuf {
    PathBuf::from("authorizations.txt")
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_sweep_interval_secs() -> u64 {
    1800 // 30 minutes
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            file: default_auth_file(),
            utc_offset_minutes: default_utc_offset_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl AuthConfig {
    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Probe executable and session limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Executable invoked as `<program> [args...] <ip> <port> <duration>`
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// CIDR networks a session may target
    #[serde(default = "default_allowed_networks")]
    pub allowed_networks: Vec<String>,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_auto_min_secs")]
    pub auto_min_secs: u64,
    #[serde(default = "default_auto_max_secs")]
    pub auto_max_secs: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
}

fn default_program() -> String {
    "./probe".to_string()
}

fn default_allowed_networks() -> Vec<String> {
    vec!["127.0.0.0/8".to_string(), "::1/128".to_string()]
}

fn default_max_duration_secs() -> u64 {
    600
}

fn default_auto_min_secs() -> u64 {
    80
}

fn default_auto_max_secs() -> u64 {
    120
}

fn default_terminate_grace_ms() -> u64 {
    2_000
}

fn default_max_sessions_per_user() -> usize {
    1
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            allowed_networks: default_allowed_networks(),
            max_duration_secs: default_max_duration_secs(),
            auto_min_secs: default_auto_min_secs(),
            auto_max_secs: default_auto_max_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
            max_sessions_per_user: default_max_sessions_per_user(),
        }
    }
}

impl ProbeConfig {
    /// Parse the allow-list; fails on the first bad entry
    pub fn networks(&self) -> Result<Vec<IpNetwork>> {
        self.allowed_networks
            .iter()
            .map(|n| {
                n.parse::<IpNetwork>()
                    .map_err(|e| anyhow!("invalid network '{}': {}", n, e))
            })
            .collect()
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Remote worker service used when a user turns offload on
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_key_env() -> Option<String> {
    Some("WARDEN_OFFLOAD_KEY".to_string())
}

fn default_api_key_header() -> String {
    "API-Key".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            api_key: None,
            api_key_header: default_api_key_header(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl OffloadConfig {
    /// Resolve the credential from config or environment
    pub fn resolve_api_key(&self) -> Option<String> {
        // Direct key takes priority
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }

        self.api_key_env
            .as_ref()
            .and_then(|env_var| std::env::var(env_var).ok())
            .filter(|key| !key.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// JSONL journal of admin and session events
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// User ids with admin rights
    #[serde(default)]
    pub admins: Vec<i64>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: project (.warden/config.toml) > user (~/.warden/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".warden").join("config.toml");
            if user_config.exists() {
                let user = Self::load_from(&user_config)?;
                config.merge(user);
            }
        }

        let project_config = Path::new(".warden").join("config.toml");
        if project_config.exists() {
            let project = Self::load_from(&project_config)?;
            config.merge(project);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority)
    /// Admin lists are concatenated; sections are replaced wholesale
    pub fn merge(&mut self, other: Config) {
        for admin in other.admins {
            if !self.admins.contains(&admin) {
                self.admins.push(admin);
            }
        }
        self.auth = other.auth;
        self.probe = other.probe;
        self.offload = other.offload;
        if other.audit.path.is_some() {
            self.audit = other.audit;
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.auth.offset().is_none() {
            errors.push(ValidationError {
                field: "auth.utc_offset_minutes".to_string(),
                message: format!(
                    "Must be within +/-1439 minutes, got {}",
                    self.auth.utc_offset_minutes
                ),
            });
        }

        if self.auth.sweep_interval_secs == 0 {
            errors.push(ValidationError {
                field: "auth.sweep_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.probe.program.trim().is_empty() {
            errors.push(ValidationError {
                field: "probe.program".to_string(),
                message: "Program must not be empty".to_string(),
            });
        }

        for (i, network) in self.probe.allowed_networks.iter().enumerate() {
            if network.parse::<IpNetwork>().is_err() {
                errors.push(ValidationError {
                    field: format!("probe.allowed_networks[{}]", i),
                    message: format!("Invalid CIDR network '{}'", network),
                });
            }
        }

        if self.probe.max_duration_secs == 0 {
            errors.push(ValidationError {
                field: "probe.max_duration_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.probe.auto_min_secs == 0
            || self.probe.auto_min_secs > self.probe.auto_max_secs
            || self.probe.auto_max_secs > self.probe.max_duration_secs
        {
            errors.push(ValidationError {
                field: "probe.auto_min_secs".to_string(),
                message: format!(
                    "Auto range {}..={} must be non-empty, positive and within max_duration_secs",
                    self.probe.auto_min_secs, self.probe.auto_max_secs
                ),
            });
        }

        if self.probe.max_sessions_per_user == 0 {
            errors.push(ValidationError {
                field: "probe.max_sessions_per_user".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Some(url) = &self.offload.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError {
                    field: "offload.base_url".to_string(),
                    message: format!("Expected an http(s) URL, got '{}'", url),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
