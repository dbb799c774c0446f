use crate::config::Config;
use async_trait::async_trait;
use clap::{ArgGroup, Parser};
use gdrive_manager_drive::api::{list_all, FileStore};
use gdrive_manager_drive::mime::{extension_for_mime, mime_for_extension};
use gdrive_manager_drive::{DriveError, DriveFile, DriveResult, ListFilter, Upload};
use std::path::{Path, PathBuf};

pub const COMMAND_NAMES: [&str; 3] = ["list", "download", "upload"];

/// A subcommand: looked up by name, configured from its own arguments, then
/// run against an authenticated store.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, args: &[String]) -> DriveResult<()>;

    async fn run(&self, store: &dyn FileStore) -> DriveResult<()>;
}

pub fn available_commands(config: &Config) -> Vec<Box<dyn Runner>> {
    vec![
        Box::new(ListCommand::new(config.drive.page_size)),
        Box::new(DownloadCommand::default()),
        Box::new(UploadCommand::default()),
    ]
}

/// Finds the command called `name` and initializes it from `args`.
pub fn resolve(name: &str, args: &[String], config: &Config) -> DriveResult<Box<dyn Runner>> {
    for mut command in available_commands(config) {
        if command.name() == name {
            command.init(args)?;
            return Ok(command);
        }
    }
    Err(DriveError::Usage(format!("unknown subcommand: {name}")))
}

fn parse_args<P: Parser>(name: &str, args: &[String]) -> DriveResult<P> {
    let argv = std::iter::once(name.to_string()).chain(args.iter().cloned());
    P::try_parse_from(argv).map_err(|e| DriveError::Usage(e.render().to_string()))
}

#[derive(Debug, Parser)]
#[command(name = "list", about = "List files and/or folders")]
#[command(group(ArgGroup::new("selection").required(true).args(["files", "folders", "all"])))]
struct ListArgs {
    /// List only files
    #[arg(long)]
    files: bool,
    /// List only folders
    #[arg(long)]
    folders: bool,
    /// List files and folders
    #[arg(long)]
    all: bool,
    #[arg(long = "page-size", value_parser = clap::value_parser!(u32).range(1..=1000))]
    page_size: Option<u32>,
}

pub struct ListCommand {
    filter: ListFilter,
    page_size: u32,
}

impl ListCommand {
    pub fn new(page_size: u32) -> Self {
        Self {
            filter: ListFilter::All,
            page_size,
        }
    }

    pub fn filter(&self) -> ListFilter {
        self.filter
    }

    pub async fn collect(&self, store: &dyn FileStore) -> DriveResult<Vec<DriveFile>> {
        let query = self.filter.query();
        list_all(store, query.as_deref(), self.page_size).await
    }
}

pub fn render_listing(filter: ListFilter, files: &[DriveFile]) -> String {
    let mut out = String::from(filter.heading());
    out.push('\n');
    if files.is_empty() {
        out.push_str("No files or folders found.\n");
    }
    for file in files {
        out.push_str(&file.display_line());
        out.push('\n');
    }
    out
}

#[async_trait]
impl Runner for ListCommand {
    fn name(&self) -> &'static str {
        "list"
    }

    fn init(&mut self, args: &[String]) -> DriveResult<()> {
        let parsed: ListArgs = parse_args(self.name(), args)?;
        self.filter = if parsed.files {
            ListFilter::Files
        } else if parsed.folders {
            ListFilter::Folders
        } else {
            ListFilter::All
        };
        if let Some(page_size) = parsed.page_size {
            self.page_size = page_size;
        }
        Ok(())
    }

    async fn run(&self, store: &dyn FileStore) -> DriveResult<()> {
        let files = self.collect(store).await?;
        print!("{}", render_listing(self.filter, &files));
        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(name = "download", about = "Download a file by id")]
struct DownloadArgs {
    /// The id of the file to be downloaded
    #[arg(long = "fileId", value_parser = clap::builder::NonEmptyStringValueParser::new())]
    file_id: String,
    /// Name of the locally created file, without extension
    #[arg(long, value_parser = clap::builder::NonEmptyStringValueParser::new())]
    filename: String,
}

#[derive(Default)]
pub struct DownloadCommand {
    file_id: String,
    filename: String,
}

/// Appends the extension registered for `content_type`, if any.
pub fn local_file_name(filename: &str, content_type: Option<&str>) -> String {
    let ext = content_type.and_then(extension_for_mime).unwrap_or_default();
    format!("{filename}{ext}")
}

#[async_trait]
impl Runner for DownloadCommand {
    fn name(&self) -> &'static str {
        "download"
    }

    fn init(&mut self, args: &[String]) -> DriveResult<()> {
        let parsed: DownloadArgs = parse_args(self.name(), args)?;
        self.file_id = parsed.file_id;
        self.filename = parsed.filename;
        Ok(())
    }

    async fn run(&self, store: &dyn FileStore) -> DriveResult<()> {
        let download = store.download(&self.file_id).await?;
        let path = local_file_name(&self.filename, download.content_type.as_deref());
        tracing::info!(
            file_id = %self.file_id,
            content_type = ?download.content_type,
            bytes = download.bytes.len(),
            "Downloaded file"
        );
        tokio::fs::write(&path, &download.bytes).await?;
        println!("Saved {path}");
        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(name = "upload", about = "Upload a local file")]
struct UploadArgs {
    /// File path of the file to be uploaded
    #[arg(long)]
    filepath: PathBuf,
}

#[derive(Default)]
pub struct UploadCommand {
    filepath: PathBuf,
}

impl UploadCommand {
    pub fn filepath(&self) -> &Path {
        &self.filepath
    }
}

#[async_trait]
impl Runner for UploadCommand {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn init(&mut self, args: &[String]) -> DriveResult<()> {
        let parsed: UploadArgs = parse_args(self.name(), args)?;
        if parsed.filepath.as_os_str().is_empty() {
            return Err(DriveError::Usage(
                "you must set the value of the filepath flag".to_string(),
            ));
        }
        if parsed.filepath.extension().is_none() {
            return Err(DriveError::Usage(
                "filename must have an extension".to_string(),
            ));
        }
        self.filepath = parsed.filepath;
        Ok(())
    }

    async fn run(&self, store: &dyn FileStore) -> DriveResult<()> {
        let name = self
            .filepath
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriveError::Usage("file path has no usable file name".to_string()))?
            .to_string();
        let ext = self
            .filepath
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let bytes = tokio::fs::read(&self.filepath).await?;
        tracing::info!(path = %self.filepath.display(), bytes = bytes.len(), "Uploading file");

        let file = store
            .upload(Upload {
                name,
                mime_type: mime_for_extension(ext).to_string(),
                bytes,
            })
            .await?;
        println!("File Id: {}", file.id);
        Ok(())
    }
}
