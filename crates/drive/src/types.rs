use serde::{Deserialize, Serialize};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl DriveFile {
    pub fn display_line(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }
}

/// One page of a `files.list` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl FileList {
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Files,
    Folders,
    All,
}

impl ListFilter {
    pub fn query(&self) -> Option<String> {
        match self {
            ListFilter::Files => Some(format!("mimeType != '{FOLDER_MIME_TYPE}'")),
            ListFilter::Folders => Some(format!("mimeType = '{FOLDER_MIME_TYPE}'")),
            ListFilter::All => None,
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            ListFilter::Files => "Files:",
            ListFilter::Folders => "Folders:",
            ListFilter::All => "Files and folders:",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}
