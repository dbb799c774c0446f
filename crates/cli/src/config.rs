use directories::ProjectDirs;
use gdrive_manager_drive::oauth::FlowSettings;
use gdrive_manager_drive::{DriveError, DriveResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub drive: DriveConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub redirect_host: String,
    pub redirect_port: u16,
    pub callback_path: String,
    pub callback_timeout_seconds: u64,
    pub open_browser: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub page_size: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("credentials.json"),
            token_path: PathBuf::from("token.json"),
            redirect_host: "localhost".to_string(),
            redirect_port: 8000,
            callback_path: "/auth/google/callback".to_string(),
            callback_timeout_seconds: 300,
            open_browser: true,
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self { page_size: 10 }
    }
}

impl AuthConfig {
    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            redirect_host: self.redirect_host.clone(),
            redirect_port: self.redirect_port,
            callback_path: self.callback_path.clone(),
            timeout: Duration::from_secs(self.callback_timeout_seconds),
            open_browser: self.open_browser,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("com", "gdrive-manager", "gdrive-manager") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

impl Config {
    pub fn load(path: &Path) -> DriveResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| DriveError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_or_default(path: &Path) -> DriveResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
