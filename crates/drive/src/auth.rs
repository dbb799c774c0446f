use crate::error::{DriveError, DriveResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    /// A missing or zero-valued expiry means the token does not expire.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) if expiry.timestamp() > 0 => {
                expiry - Duration::seconds(EXPIRY_SKEW_SECS) <= Utc::now()
            }
            _ => false,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` means the user has to go through the browser flow again.
    pub fn load(&self) -> Option<StoredToken> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), "No cached token: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable token cache: {e}");
                None
            }
        }
    }

    pub fn save(&self, token: &StoredToken) -> DriveResult<()> {
        println!("Saving credential file to: {}", self.path.display());
        let json = serde_json::to_vec(token)?;
        write_secure_file(&self.path, &json)
    }
}

fn write_secure_file(path: &Path, bytes: &[u8]) -> DriveResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    // `mode` only applies on creation, tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(rename = "auth_uri")]
    pub auth_url: String,
    #[serde(rename = "token_uri")]
    pub token_url: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> DriveResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DriveError::Config(format!(
                "Unable to read client secret file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> DriveResult<Self> {
        let file: ClientSecretsFile = serde_json::from_str(content).map_err(|e| {
            DriveError::Config(format!("Unable to parse client secret file to config: {e}"))
        })?;
        let secrets = file.installed.or(file.web).ok_or_else(|| {
            DriveError::Config("client secret file has neither an \"installed\" nor a \"web\" section".to_string())
        })?;
        if secrets.client_id.is_empty() {
            return Err(DriveError::Config("client_id is empty".to_string()));
        }
        Ok(secrets)
    }
}
