//! Outlook MCP Server
//!
//! Serves Outlook mail and calendar search over the Model Context Protocol
//! on stdio, backed by Microsoft Graph.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use outlook_mcp_server_rust::config::Config;
use outlook_mcp_server_rust::error::Result;
use outlook_mcp_server_rust::graph::auth::MicrosoftAuthenticator;
use outlook_mcp_server_rust::graph::client::GraphClient;
use outlook_mcp_server_rust::graph::token_cache::TokenCache;
use outlook_mcp_server_rust::graph::token_manager::TokenManager;
use outlook_mcp_server_rust::mcp::server::McpServer;

#[derive(Parser)]
#[command(name = "outlook-mcp-server")]
#[command(author, version, about = "Outlook MCP Server - Microsoft Graph mail and calendar search over MCP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a Microsoft account and cache the tokens (run this first)
    Auth {
        /// Account key to store the tokens under
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::new()?;

    match cli.command {
        Some(Commands::Auth { account }) => {
            if let Some(account) = account {
                config.account = account;
            }
            let authenticator = MicrosoftAuthenticator::new(config)?;
            let credential = authenticator.authenticate_interactive().await?;
            eprintln!(
                "Tokens cached in {} (valid until {})",
                authenticator.cache().path().display(),
                chrono::DateTime::from_timestamp(credential.expires_at, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| credential.expires_at.to_string())
            );
        }
        None => run_server(config).await?,
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    if !config.token_cache_exists() && !config.interactive {
        eprintln!("Error: no token cache at {}.", config.token_cache_path.display());
        eprintln!("Run 'outlook-mcp-server auth' first, or set OUTLOOK_INTERACTIVE=true.");
        std::process::exit(1);
    }

    let authenticator = Arc::new(MicrosoftAuthenticator::new(config.clone())?);

    let token_manager = TokenManager::builder(TokenCache::new(&config.token_cache_path), authenticator)
        .account(config.account.clone())
        .margin_seconds(config.token_margin_secs)
        .lock_wait(config.lock_wait)
        .build()
        .await?;
    tracing::info!("Signed in as account '{}'", config.account);

    let graph_client = Arc::new(GraphClient::from_config(&config, Arc::new(token_manager))?);

    let mut server = McpServer::new(graph_client);
    server.run_stdio().await
}
