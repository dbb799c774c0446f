use crate::error::{DriveError, DriveResult};
use crate::types::{Download, DriveFile, FileList, Upload};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use std::time::Duration;

const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const LIST_FIELDS: &str = "nextPageToken, files(id, name)";

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list_page(
        &self,
        query: Option<&str>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> DriveResult<FileList>;

    async fn download(&self, file_id: &str) -> DriveResult<Download>;

    async fn upload(&self, upload: Upload) -> DriveResult<DriveFile>;
}

/// Follows continuation tokens until the backend stops returning one.
/// Files are kept in the order the pages arrived.
pub async fn list_all(
    store: &dyn FileStore,
    query: Option<&str>,
    page_size: u32,
) -> DriveResult<Vec<DriveFile>> {
    let mut files = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let page = store
            .list_page(query, page_size, page_token.as_deref())
            .await?;
        let next = page.continuation().map(String::from);
        files.extend(page.files);
        tracing::info!("Number of files: {}", files.len());

        match next {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(files)
}

#[derive(Clone)]
pub struct DriveApi {
    client: Client,
    base_url: String,
    access_token: String,
}

impl DriveApi {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(DRIVE_API_BASE, access_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent("gdrive-manager/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.base_url)
    }

    /// Percent-encodes `file_id` as a single path segment.
    fn file_url(&self, file_id: &str) -> DriveResult<Url> {
        let mut url = Url::parse(&self.files_url())
            .map_err(|e| DriveError::Config(format!("invalid Drive API base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| DriveError::Config("Drive API base url cannot have a path".to_string()))?
            .push(file_id);
        Ok(url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[async_trait]
impl FileStore for DriveApi {
    async fn list_page(
        &self,
        query: Option<&str>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> DriveResult<FileList> {
        let mut request = self
            .client
            .get(self.files_url())
            .header("Authorization", self.bearer())
            .query(&[("pageSize", page_size.to_string())])
            .query(&[("fields", LIST_FIELDS)]);
        if let Some(q) = query {
            request = request.query(&[("q", q)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn download(&self, file_id: &str) -> DriveResult<Download> {
        let response = self
            .client
            .get(self.file_url(file_id)?)
            .header("Authorization", self.bearer())
            .query(&[("alt", "media")])
            .send()
            .await?;
        let response = check_status(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await?;

        Ok(Download {
            content_type,
            bytes: bytes.to_vec(),
        })
    }

    async fn upload(&self, upload: Upload) -> DriveResult<DriveFile> {
        let boundary = format!("gdrive-manager-{:016x}", rand::thread_rng().gen::<u64>());
        let metadata = serde_json::json!({
            "name": upload.name,
            "mimeType": upload.mime_type,
        });
        let body = multipart_related(&boundary, &metadata, &upload.mime_type, &upload.bytes);

        let response = self
            .client
            .post(format!("{}/upload/drive/v3/files", self.base_url))
            .header("Authorization", self.bearer())
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .query(&[("uploadType", "multipart"), ("fields", "id, name, mimeType")])
            .body(body)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

fn multipart_related(boundary: &str, metadata: &Value, mime_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

async fn check_status(response: Response) -> DriveResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or(text);
    Err(DriveError::Remote {
        status: status.as_u16(),
        message,
    })
}
