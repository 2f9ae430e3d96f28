use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use rust_tcp_chat::common::{ChatBroadcast, Message};
use rust_tcp_chat::config::{self, AppConfig};
use rust_tcp_chat::network::{ChatClient, ChatServer};
use rust_tcp_chat::storage::{self, SqliteHistoryStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "rust_tcp_chat",
    version,
    about = "TCP chat server with persistent history"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the chat server (default)
    Serve(ServeArgs),
    /// Send one chat message and exit
    Send {
        #[arg(long, value_name = "ADDR")]
        server: String,
        text: String,
    },
    /// Print one page of history
    History {
        #[arg(long, value_name = "ADDR")]
        server: String,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
    /// Print chat messages as they arrive
    Listen {
        #[arg(long, value_name = "ADDR")]
        server: String,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long, env = PORT_ENV)]
    port: Option<u16>,
    /// SQLite file holding the chat history
    #[arg(long, value_name = "PATH")]
    database: Option<String>,
}

const PORT_ENV: &str = "CHAT_PORT";

impl ServeArgs {
    /// Arguments for a bare invocation, where clap never sees the serve flags.
    fn from_env() -> Self {
        let port = std::env::var(PORT_ENV).ok().and_then(|value| match value.parse() {
            Ok(port) => Some(port),
            Err(err) => {
                log::warn!("Ignoring {PORT_ENV}={value}: {err}");
                None
            }
        });
        Self {
            port,
            ..Self::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match cli.mode {
        None => run_server(config::load_config(&cli.config), ServeArgs::from_env()).await,
        Some(Mode::Serve(args)) => run_server(config::load_config(&cli.config), args).await,
        Some(Mode::Send { server, text }) => send_message(&server, text).await,
        Some(Mode::History {
            server,
            page,
            page_size,
        }) => show_history(&server, page, page_size).await,
        Some(Mode::Listen { server }) => listen(&server).await,
    }
}

async fn run_server(file_config: AppConfig, args: ServeArgs) -> Result<()> {
    let config = file_config.with_overrides(args.host, args.port, args.database);

    storage::ensure_parent_dir(&config.database_path).with_context(|| {
        format!("failed to create data directory for {}", config.database_path)
    })?;
    let store = SqliteHistoryStore::open(&config.database_path)
        .with_context(|| format!("failed to open history database {}", config.database_path))?;
    log::info!("Chat history stored in {}", config.database_path);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received"),
            Err(err) => log::error!("Failed to listen for Ctrl-C: {err}"),
        }
        signal.cancel();
    });

    let server = ChatServer::new(Arc::new(store));
    server
        .start(config.bind_address(), shutdown)
        .await
        .context("chat server stopped with an error")
}

async fn send_message(server: &str, text: String) -> Result<()> {
    if text.trim().is_empty() {
        bail!("refusing to send an empty message");
    }
    let mut client = ChatClient::connect(server)
        .await
        .with_context(|| format!("could not reach {server}"))?;
    client.send_chat(text).await?;
    client.close().await?;
    Ok(())
}

async fn show_history(server: &str, page: i64, page_size: i64) -> Result<()> {
    let mut client = ChatClient::connect(server)
        .await
        .with_context(|| format!("could not reach {server}"))?;
    client.request_history(page, page_size).await?;

    while let Some(message) = client.recv().await? {
        if let Message::HistoryResponse(response) = message {
            println!(
                "Page {} ({} per page), {} message(s) in total",
                response.page, response.page_size, response.total_messages
            );
            for chat in response.messages.iter().rev() {
                print_chat(chat);
            }
            return Ok(());
        }
    }
    bail!("server closed the connection before answering")
}

async fn listen(server: &str) -> Result<()> {
    let mut client = ChatClient::connect(server)
        .await
        .with_context(|| format!("could not reach {server}"))?;

    while let Some(message) = client.recv().await? {
        match message {
            Message::ChatBroadcast(chat) => print_chat(&chat),
            other => log::debug!("Ignoring {}", other.kind()),
        }
    }
    log::info!("Server closed the connection");
    Ok(())
}

fn print_chat(chat: &ChatBroadcast) {
    println!(
        "[{}] {}: {}",
        chat.sent_at.format("%Y-%m-%d %H:%M:%S"),
        chat.sender,
        chat.content
    );
}
