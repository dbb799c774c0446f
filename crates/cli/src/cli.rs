use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gdrive-manager",
    version,
    about = "List, download and upload Google Drive files",
    subcommand_required = true,
    arg_required_else_help = true,
    after_help = "Commands:\n  list      --files | --folders | --all [--page-size N]\n  download  --fileId <ID> --filename <NAME>\n  upload    --filepath <PATH>"
)]
pub struct Cli {
    /// Path to config.toml
    #[arg(long, env = "GDRIVE_MANAGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// OAuth client secret file, overrides the config value
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Token cache file, overrides the config value
    #[arg(long)]
    pub token: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Invocation,
}

#[derive(Debug, Subcommand)]
pub enum Invocation {
    /// The subcommand name followed by its own flags; parsed by the command itself.
    #[command(external_subcommand)]
    Command(Vec<String>),
}

impl Invocation {
    pub fn split(&self) -> (&str, &[String]) {
        let Invocation::Command(argv) = self;
        match argv.split_first() {
            Some((name, args)) => (name.as_str(), args),
            None => ("", &[]),
        }
    }
}
