use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use todo_chat::config::{ChatConfig, ServerConfig, DEFAULT_OUTBOUND_BUFFER};
use todo_chat::messages::ServerMessage;
use todo_chat::retention::{ExpiredEntryPolicy, RetentionConfig};

/// Upper bound for `--retention-secs` (100 years).
const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "todo-chat", author, version)]
#[command(about = "Todo store and per-room chat relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message to a room and print the window that comes back
    Send {
        /// Server URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Room to post into
        #[arg(short, long)]
        room: String,

        /// JSON object to send, e.g. '{"username":"ann","content":"hi"}'
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TODO_CHAT_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Redis connection URI holding todos and chat history.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Number of recent messages pushed on every broadcast.
    #[arg(long, env = "TODO_CHAT_HISTORY_WINDOW", default_value_t = 50)]
    pub history_window: usize,

    /// Age after which a chat message is no longer served and gets swept.
    #[arg(long, env = "TODO_CHAT_RETENTION_SECS", default_value_t = 1800)]
    pub retention_secs: u64,

    /// Interval between retention sweeps.
    #[arg(long, env = "TODO_CHAT_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// What history reads do with expired or unreadable entries.
    #[arg(
        long,
        env = "TODO_CHAT_EXPIRED_ENTRIES",
        value_enum,
        default_value_t = ExpiredEntryPolicy::Skip
    )]
    pub expired_entries: ExpiredEntryPolicy,

    /// Frames buffered per connection before pushes are dropped.
    #[arg(long, env = "TODO_CHAT_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Directory served for any path not matched by the API.
    #[arg(long, env = "TODO_CHAT_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Grace period for background tasks during shutdown.
    #[arg(long, env = "TODO_CHAT_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(args.history_window > 0, "history window must be greater than zero");
        ensure!(args.retention_secs > 0, "retention must be greater than zero");
        ensure!(
            args.retention_secs <= MAX_RETENTION_SECS,
            "retention must be at most {MAX_RETENTION_SECS} seconds"
        );
        ensure!(
            args.sweep_interval_secs > 0,
            "sweep interval must be greater than zero"
        );
        ensure!(
            args.outbound_buffer > 0,
            "outbound buffer must be greater than zero"
        );
        let horizon = i64::try_from(args.retention_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .with_context(|| format!("retention out of range: {}", args.retention_secs))?;

        Ok(ServerConfig {
            listen_addr,
            redis_url: args.redis_url,
            static_dir: args.static_dir,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            chat: ChatConfig {
                retention: RetentionConfig {
                    window: args.history_window,
                    horizon,
                    sweep_interval: Duration::from_secs(args.sweep_interval_secs),
                    expired_entries: args.expired_entries,
                },
                outbound_buffer: args.outbound_buffer,
            },
        })
    }
}

pub async fn run_send_client(url: &str, room: &str, message: &str, wait: Duration) -> Result<()> {
    let endpoint = format!("{}/ws/chat/{}", url.trim_end_matches('/'), room);
    let (ws, _) = connect_async(endpoint.as_str())
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    debug!(%endpoint, "connected");
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(message.to_string().into()))
        .await
        .context("failed to send message")?;

    let reply = timeout(wait, async {
        while let Some(frame) = stream.next().await {
            match frame.context("websocket error")? {
                Message::Text(text) => {
                    let reply: ServerMessage =
                        serde_json::from_str(&text).context("unexpected frame from server")?;
                    return Ok(Some(reply));
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }
        Ok::<_, anyhow::Error>(None)
    })
    .await
    .context("timed out waiting for a reply")??;

    match reply {
        Some(ServerMessage::Messages { messages }) => {
            for entry in messages {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Some(ServerMessage::Error { message }) => bail!("server rejected message: {message}"),
        None => bail!("connection closed before a reply arrived"),
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}
