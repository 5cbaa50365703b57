//! Ruby Agent CLI
//!
//! `serve` runs the streaming chat server, `chat` talks to one.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ruby_agent_lib::prompt::{
    ConfirmationHandler, ConsoleConfirmationHandler, StaticConfirmationHandler,
};
use ruby_agent_lib::{AgentConfig, RubyClient, RubyServer};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Ruby Agent - streaming chat server with tool confirmations
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.json, .toml, .yaml or .yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server until Ctrl+C or SIGTERM
    Serve(ServeArgs),
    /// Chat with a running server
    Chat(ChatArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Args)]
struct ChatArgs {
    /// Server base URL, e.g. http://localhost:3001
    #[arg(long)]
    server_url: Option<String>,

    #[arg(long)]
    system_prompt: Option<String>,

    /// Approve every tool confirmation
    #[arg(long, conflicts_with = "no")]
    yes: bool,

    /// Decline every tool confirmation
    #[arg(long)]
    no: bool,

    /// Message to send; starts an interactive session when omitted
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }

    init_tracing(&config.server.log_level, cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(config, args).await,
        Command::Chat(args) => chat(config, args).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read a config file, picking the format from its extension
fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let Some(path) = path else {
        return Ok(AgentConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let config: AgentConfig = match extension.as_str() {
        "json" => serde_json::from_str(&contents)?,
        "toml" => toml::from_str(&contents)?,
        "yaml" | "yml" => serde_yaml::from_str(&contents)?,
        other => bail!("unsupported config format '{}' for {}", other, path.display()),
    };
    Ok(config)
}

async fn serve(mut config: AgentConfig, args: ServeArgs) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        provider = ?config.provider.kind,
        "Starting Ruby agent server"
    );
    RubyServer::new(config).start().await?;
    Ok(())
}

async fn chat(mut config: AgentConfig, args: ChatArgs) -> Result<()> {
    if let Some(url) = args.server_url {
        config.client.server_url = url;
        // An explicit server URL also decides the stream endpoint
        config.client.ws_url = None;
    }
    config.validate()?;

    let handler: Arc<dyn ConfirmationHandler> = if args.yes {
        Arc::new(StaticConfirmationHandler::new(true))
    } else if args.no {
        Arc::new(StaticConfirmationHandler::new(false))
    } else {
        Arc::new(ConsoleConfirmationHandler::new())
    };
    let client = RubyClient::new(config.client.clone()).with_confirmation_handler(handler);

    let session_id = client
        .create_session(args.system_prompt.as_deref())
        .await
        .with_context(|| format!("creating a session on {}", config.client.server_url))?;
    tracing::info!(%session_id, "Session created");

    let result = match args.message {
        Some(message) => send(&client, &session_id, &message).await,
        None => repl(&client, &session_id).await,
    };

    if let Err(e) = client.delete_session(&session_id).await {
        tracing::warn!(%session_id, "Failed to delete session: {}", e);
    }
    result
}

async fn repl(client: &RubyClient, session_id: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            return Ok(());
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => return Ok(()),
            message => {
                if let Err(e) = send(client, session_id, message).await {
                    eprintln!("error: {:#}", e);
                }
            }
        }
    }
}

/// Stream one reply to stdout as it arrives
async fn send(client: &RubyClient, session_id: &str, message: &str) -> Result<()> {
    let mut stream = client.chat_stream(session_id, message).await?;
    let mut stdout = std::io::stdout();

    while let Some(chunk) = stream.next_chunk().await {
        let chunk = chunk?;
        if chunk.done {
            break;
        }
        write!(stdout, "{}", chunk.content)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
