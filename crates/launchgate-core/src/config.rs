use crate::error::{GateError, Result};
use crate::paths;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StaleConfigPolicy
// ---------------------------------------------------------------------------

/// What a cold start does when the cached remote config has expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleConfigPolicy {
    /// Go native; a new fetch happens only after `launchgate reset`.
    #[default]
    RequireReset,
    /// Fetch a fresh config with the stored attribution payload.
    Refetch,
}

// ---------------------------------------------------------------------------
// ProbeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Host to dial. Defaults to the endpoint host.
    #[serde(default)]
    pub host: Option<String>,
    /// Port to dial. Defaults to the endpoint port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    2000
}

fn default_probe_connect_timeout_ms() -> u64 {
    1500
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            interval_ms: default_probe_interval_ms(),
            connect_timeout_ms: default_probe_connect_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_attribution_wait_secs")]
    pub attribution_wait_secs: u64,
    #[serde(default = "default_permission_cooldown_days")]
    pub permission_cooldown_days: u32,
    #[serde(default)]
    pub stale_config: StaleConfigPolicy,
    #[serde(default)]
    pub probe: ProbeConfig,
}

fn default_endpoint() -> String {
    "https://config.example.com/config".to_string()
}

fn default_fallback_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_attribution_wait_secs() -> u64 {
    15
}

fn default_permission_cooldown_days() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            attribution_wait_secs: default_attribution_wait_secs(),
            permission_cooldown_days: default_permission_cooldown_days(),
            stale_config: StaleConfigPolicy::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(GateError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// The endpoint as an absolute http(s) URL.
    pub fn endpoint_url(&self) -> Result<Url> {
        let url = Url::parse(&self.endpoint)
            .map_err(|_| GateError::InvalidEndpoint(self.endpoint.clone()))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(GateError::InvalidEndpoint(self.endpoint.clone())),
        }
    }

    /// Host and port the reachability probe dials.
    pub fn probe_target(&self) -> Result<(String, u16)> {
        if let (Some(host), Some(port)) = (&self.probe.host, self.probe.port) {
            return Ok((host.clone(), port));
        }
        let url = self.endpoint_url()?;
        let host = match &self.probe.host {
            Some(host) => host.clone(),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let port = self
            .probe
            .port
            .or_else(|| url.port_or_known_default())
            .ok_or_else(|| GateError::InvalidEndpoint(self.endpoint.clone()))?;
        Ok((host, port))
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attribution_wait(&self) -> Duration {
        Duration::from_secs(self.attribution_wait_secs)
    }

    pub fn permission_cooldown(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.permission_cooldown_days))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe.interval_ms)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.connect_timeout_ms)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        match self.endpoint_url() {
            Ok(url) => {
                if url.scheme() != "https" {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!(
                            "endpoint '{}' is not HTTPS; the attribution payload is sent in clear text",
                            self.endpoint
                        ),
                    });
                }
            }
            Err(e) => warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            }),
        }

        if self.fallback_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "fallback_timeout_ms=0 sends every cold start with a pending fetch \
                          straight to the native app"
                    .to_string(),
            });
        }

        if self.request_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "request_timeout_secs=0 makes every config fetch time out".to_string(),
            });
        }

        if self.probe.interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "probe.interval_ms must be greater than zero".to_string(),
            });
        }

        warnings
    }
}
