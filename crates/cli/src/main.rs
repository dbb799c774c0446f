use anyhow::{Context, Result};
use clap::Parser;
use gdrive_manager::cli::Cli;
use gdrive_manager::commands;
use gdrive_manager::config::{default_config_path, Config};
use gdrive_manager_drive::api::DriveApi;
use gdrive_manager_drive::auth::{ClientSecrets, TokenCache};
use gdrive_manager_drive::oauth::{load_or_authorize, OAuthClient};
use gdrive_manager_drive::DriveError;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gdrive_manager=info,gdrive_manager_drive=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = match e.downcast_ref::<DriveError>() {
                Some(drive_err) => {
                    if !drive_err.is_usage() {
                        eprintln!("{}", drive_err.user_message());
                    }
                    drive_err.exit_code()
                }
                None => 1,
            };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Some(path) = cli.credentials {
        config.auth.credentials_path = path;
    }
    if let Some(path) = cli.token {
        config.auth.token_path = path;
    }

    // Parse the subcommand before touching credentials so bad flags have no side effects.
    let (name, args) = cli.command.split();
    let command = commands::resolve(name, args, &config)?;

    let secrets = ClientSecrets::load(&config.auth.credentials_path)?;
    let oauth = OAuthClient::new(secrets);
    let cache = TokenCache::new(&config.auth.token_path);
    let token = load_or_authorize(&oauth, &cache, config.auth.flow_settings()).await?;

    let api = DriveApi::new(token.access_token);
    command
        .run(&api)
        .await
        .with_context(|| format!("Subcommand {name} failed"))?;
    Ok(())
}
