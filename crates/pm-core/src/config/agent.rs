//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Top-level configuration for the pulsemon agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control API access
    pub api: ApiConfig,

    /// Reverse tunnel settings
    pub reverse: TunnelConfig,

    /// Check bundle management settings
    pub check: CheckConfig,

    /// Local HTTP listener settings
    pub server: ServerConfig,
}

/// Control API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the control API
    pub url: String,

    /// API token credentials
    pub token: TokenConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.circonus.com/v2/".to_string(),
            token: TokenConfig::default(),
        }
    }
}

/// API token key and application name sent with every request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Token key (required whenever the agent needs the API)
    pub key: String,

    /// Application name the token was provisioned for
    pub app: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            app: "pulsemon".to_string(),
        }
    }
}

/// Reverse tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Whether the reverse tunnel is enabled
    pub enabled: bool,

    /// Check bundle ID to use (empty: search, then optionally create)
    pub check_bundle_cid: String,

    /// Optional broker CA certificate file; fetched from the API when unset
    pub broker_ca_file: Option<PathBuf>,

    /// TLS dial timeout
    #[serde(with = "duration_secs")]
    pub dialer_timeout: Duration,

    /// Consecutive dial failures before the check config is refreshed
    pub max_conn_retry: u32,

    /// Largest payload placed in a single response data frame
    pub max_frame_payload: usize,

    /// Backoff between connection attempts
    pub backoff: BackoffConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_bundle_cid: String::new(),
            broker_ca_file: None,
            dialer_timeout: Duration::from_secs(15),
            max_conn_retry: 10,
            max_frame_payload: 65536,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Check bundle management settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Enable new metrics on the check bundle as they appear locally
    pub enable_new_metrics: bool,

    /// How long cached broker-side metric states stay fresh
    #[serde(with = "duration_secs")]
    pub metric_refresh_ttl: Duration,

    /// Directory holding the persisted metric-state file
    pub state_path: PathBuf,

    /// Create a check bundle when none is found
    pub create: bool,

    /// Broker CID used when creating a check bundle
    pub broker: String,

    /// Check target host (defaults to this machine's hostname)
    pub target: Option<String>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enable_new_metrics: false,
            metric_refresh_ttl: Duration::from_secs(300),
            state_path: super::default_config_dir().join("state"),
            create: false,
            broker: String::new(),
            target: None,
        }
    }
}

impl CheckConfig {
    /// Get the check target, falling back to hostname
    pub fn target_host(&self) -> String {
        self.target
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// Local HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the local metrics endpoint
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:2609".to_string(),
        }
    }
}
