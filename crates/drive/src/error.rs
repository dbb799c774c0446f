use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Drive API error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriveError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DriveError::Config(_) => "Check the client secret file and config.toml.",
            DriveError::Authorization(_) => "Authorization failed. Please re-run to authenticate again.",
            DriveError::Timeout(_) => "Nobody completed the browser sign-in in time.",
            DriveError::Usage(_) => "Invalid arguments. Run with --help for usage.",
            DriveError::Remote { .. } => "Google Drive rejected the request.",
            DriveError::Network(_) => "Network error. Check your connection.",
            DriveError::Io(_) => "Local file error.",
            DriveError::Json(_) => "Unexpected response format.",
        }
    }

    /// Usage errors exit with 2, everything else with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            DriveError::Usage(_) => 2,
            _ => 1,
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, DriveError::Usage(_))
    }
}

pub type DriveResult<T> = Result<T, DriveError>;
