use crate::map::{AdvisorySize, PanelLayout};
use crate::sync::SyncSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "SOILMAP_KERNEL_CONFIG";
pub const ADMIN_ENV: &str = "SOILMAP_ADMIN";
const DEFAULT_CONFIG_PATH: &str = "kernel.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Invalid {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("operator identity missing: set SOILMAP_ADMIN or `admin` in the config file")]
    MissingIdentity,
    #[error("operator identity {0:?} contains reserved characters")]
    InvalidIdentity(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub admin: Option<String>,
    pub mqtt: MqttConf,
    pub sync: SyncConf,
    pub http: HttpConf,
    pub layout: LayoutConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Préfixe des topics : le chemin store `P` vit sur `<prefix>/P`
    pub topic_prefix: String,
    /// Attente max du PUBACK d'une écriture
    pub ack_timeout_ms: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "soilmap-kernel".into(),
            keep_alive_secs: 15,
            topic_prefix: "soilmap".into(),
            ack_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConf {
    pub suppress_cooldown_ms: u64,
    pub identity_timeout_ms: u64,
}

impl Default for SyncConf {
    fn default() -> Self {
        Self {
            suppress_cooldown_ms: 2000,
            identity_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LayoutConf {
    pub panel_offset: (f64, f64),
    pub panel_width: f64,
    pub panel_height: f64,
    pub advisory_width: f64,
    pub advisory_height: f64,
}

impl Default for LayoutConf {
    fn default() -> Self {
        let panel = PanelLayout::default();
        Self {
            panel_offset: panel.offset,
            panel_width: panel.width,
            panel_height: panel.height,
            advisory_width: 280.0,
            advisory_height: 140.0,
        }
    }
}

impl KernelConfig {
    /// L'identité vient de l'environnement en priorité, sinon du fichier
    pub fn operator_identity(&self, from_env: Option<String>) -> Result<String, ConfigError> {
        let identity = from_env
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.admin.clone().filter(|v| !v.trim().is_empty()))
            .map(|v| v.trim().to_string())
            .ok_or(ConfigError::MissingIdentity)?;

        // l'identité finit dans un chemin store et un topic MQTT
        if identity.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidIdentity(identity));
        }
        Ok(identity)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            suppress_cooldown: Duration::from_millis(self.sync.suppress_cooldown_ms),
            identity_timeout: Duration::from_millis(self.sync.identity_timeout_ms),
            panel: PanelLayout {
                offset: self.layout.panel_offset,
                width: self.layout.panel_width,
                height: self.layout.panel_height,
            },
            advisory: AdvisorySize {
                width: self.layout.advisory_width,
                height: self.layout.advisory_height,
            },
        }
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(KernelConfig::default());
    }

    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Invalid {
        path: path.display().to_string(),
        source,
    })
}
