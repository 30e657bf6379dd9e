use std::path::{Path, PathBuf};
use std::time::Duration;

use envconfig::Envconfig;
use eyre::{Context, Result};
use serde::Deserialize;

/// Environment-sourced settings: one `Envconfig` derive, defaults
/// baked in via `#[envconfig(default = ...)]`.
#[derive(Envconfig, Debug, Clone)]
pub struct EnvConfig {
    #[envconfig(from = "HALOY_DATA_DIR", default = "/var/lib/haloy")]
    pub data_dir: PathBuf,
    #[envconfig(from = "HALOY_CONFIG_DIR", default = "/etc/haloy")]
    pub config_dir: PathBuf,
    #[envconfig(from = "HALOY_API_TOKEN")]
    pub api_token: Option<String>,
    #[envconfig(from = "HALOY_DEBUG", default = "false")]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    /// e.g. `api.example.com`, so the API is additionally reachable
    /// through the proxy.
    pub domain: Option<String>,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            domain: None,
            port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    9999
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerSection {
    #[serde(default)]
    pub connection: haloyd_common::docker::DockerConnection,
    #[serde(default = "default_network_name")]
    pub network_name: String,
}

fn default_network_name() -> String {
    "haloyd".to_owned()
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            connection: Default::default(),
            network_name: default_network_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CertificatesSection {
    pub acme_email: Option<String>,
    #[serde(default)]
    pub acme_directory: Option<String>,
    #[serde(default)]
    pub staging: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthMonitorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_fall")]
    pub fall: u32,
    #[serde(default = "default_rise")]
    pub rise: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    15
}
fn default_fall() -> u32 {
    3
}
fn default_rise() -> u32 {
    2
}
fn default_timeout() -> u64 {
    5
}

impl Default for HealthMonitorSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_interval(),
            fall: default_fall(),
            rise: default_rise(),
            timeout_secs: default_timeout(),
        }
    }
}

impl HealthMonitorSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `haloyd.yaml`, the declarative daemon-wide settings file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct YamlConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub certificates: CertificatesSection,
    #[serde(default)]
    pub health_monitor: HealthMonitorSection,
}

impl YamlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: EnvConfig,
    pub yaml: YamlConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = EnvConfig::init_from_env().context("reading environment configuration")?;
        let dotenv_path = env.config_dir.join(".env");
        if dotenv_path.exists() {
            dotenvy::from_path(&dotenv_path).ok();
        }
        let yaml = YamlConfig::load(&env.config_dir.join("haloyd.yaml"))?;
        if yaml.certificates.acme_email.is_none() && yaml.api.domain.is_some() {
            // Not fatal here: per-app domains may each carry their own
            // acme_email override. The cert manager re-checks at
            // issuance time and fails that one domain.
            tracing::warn!(
                "certificates.acme_email is unset; apps without a per-domain override will fail ACME issuance"
            );
        }
        Ok(Self { env, yaml })
    }

    pub fn cert_storage_dir(&self) -> PathBuf {
        self.env.data_dir.join("cert-storage")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.env.data_dir.join("layers")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.env.data_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("haloyd.sqlite3")
    }
}
