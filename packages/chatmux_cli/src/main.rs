use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod history;
mod render;

use config::FileConfig;

#[derive(Parser)]
#[command(name = "chatmux")]
#[command(about = "Streaming chat sessions over one multiplexed connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (defaults to the platform config dir + /chatmux)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Override `connection.url`
    #[arg(long, global = true)]
    url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat in a single session
    Chat(ChatArgs),

    /// Send every prompt to several independent sessions
    Multi(MultiArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct ChatArgs {
    /// Session id to use (default: a new random id)
    #[arg(short, long)]
    session: Option<String>,

    /// JSON file to load the session's earlier turns from
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Parser)]
struct MultiArgs {
    /// Number of sessions
    #[arg(short = 'n', long, default_value = "2")]
    sessions: usize,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "chatmux=debug,chatmux_cli=debug,info"
    } else {
        "chatmux=info,chatmux_cli=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config_dir = config::resolve_config_dir(cli.config_dir.clone())?;
    debug!(config_dir = %config_dir.display(), "loading config");
    let file_config: FileConfig = config::load_config(&config_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;
    let url = cli.url.as_deref();

    match cli.command {
        Commands::Chat(args) => {
            cli::chat_command(&file_config, url, args.session, args.history).await
        }
        Commands::Multi(args) => cli::multi_command(&file_config, url, args.sessions).await,
        Commands::Config => {
            print!("{}", file_config.to_display_toml()?);
            Ok(())
        }
    }
}
