//! ModelRelay CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the gateway HTTP server
//! - `routes`  — Print the configured routing table
//! - `token`   — Mint an operator JWT for the admin surface

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use modelrelay_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "modelrelay",
    about = "ModelRelay — one chat-completion API in front of many LLM providers.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway HTTP server
    Serve {
        /// Override the bind address (e.g. 127.0.0.1:9000)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Print the configured routing table
    Routes,

    /// Mint an operator JWT signed with the configured access secret
    Token {
        /// Role: admin, developer, viewer, or system
        #[arg(long, default_value = "developer")]
        role: String,

        /// Subject (user id)
        #[arg(long, default_value = "operator")]
        user: String,

        /// Email claim
        #[arg(long, default_value = "operator@localhost")]
        email: String,

        /// Workspace id claim
        #[arg(long, default_value = "default")]
        workspace: String,

        /// Project id claim
        #[arg(long)]
        project: Option<String>,
    },
}

fn init_logging(config: &AppConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { &config.log.level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log.format == "text" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("config error: {e}"))?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve { listen } => commands::serve::run(config, listen).await,
        Commands::Routes => commands::routes::run(&config),
        Commands::Token {
            role,
            user,
            email,
            workspace,
            project,
        } => commands::token::run(&config, &role, &user, &email, &workspace, project.as_deref()),
    }
}
