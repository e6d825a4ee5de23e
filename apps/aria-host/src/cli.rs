use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::workspace::WorkspacePaths;

#[derive(Parser, Debug)]
#[command(name = "aria-host")]
#[command(about = "Aria Bridge workspace host and event tail client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Preferred listen port (next free port is used when taken)
    #[arg(long)]
    pub port: Option<u16>,

    /// Workspace root holding the .aria directory
    #[arg(long)]
    pub workspace: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Subscribe as a consumer and print the filtered event stream
    Tail {
        /// Host url (read from the discovery file when omitted)
        #[arg(long)]
        url: Option<String>,

        /// Workspace secret (read from the discovery file when omitted)
        #[arg(long)]
        secret: Option<String>,

        /// Workspace root for discovery lookup
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Subscription levels (errors, warn, info, trace)
        #[arg(long, value_delimiter = ',', default_value = "trace")]
        levels: Vec<String>,

        /// Capability filter (empty = everything)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Noise filter: off, minimal or aggressive
        #[arg(long)]
        llm_filter: Option<String>,
    },
}

/// Connect as a consumer, subscribe, and print each event as one JSON line.
pub async fn run_tail(
    url: Option<String>,
    secret: Option<String>,
    workspace: Option<PathBuf>,
    levels: Vec<String>,
    capabilities: Vec<String>,
    llm_filter: Option<String>,
) -> Result<()> {
    let (url, secret) = match (url, secret) {
        (Some(url), Some(secret)) => (url, secret),
        (url, secret) => {
            let root = workspace.unwrap_or_else(|| PathBuf::from("."));
            let paths = WorkspacePaths::new(root);
            let raw = std::fs::read_to_string(paths.discovery_path())
                .with_context(|| format!("no discovery file at {}", paths.discovery_path().display()))?;
            let meta: crate::workspace::DiscoveryMetadata = serde_json::from_str(&raw)?;
            (url.unwrap_or(meta.url), secret.unwrap_or(meta.secret))
        }
    };

    debug!(%url, "connecting");
    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(&url))
        .await
        .context("connection timeout - is the host running?")??;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(
            json!({"type": "auth", "secret": secret, "role": "consumer"}).to_string(),
        ))
        .await?;

    let auth_ack = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                let value: Value = serde_json::from_str(&text)?;
                match value.get("type").and_then(Value::as_str) {
                    Some("auth_success") => return Ok::<_, anyhow::Error>(value),
                    _ => continue,
                }
            }
        }
        Err(anyhow::anyhow!("connection closed during auth"))
    })
    .await
    .context("timeout waiting for auth_success")??;
    debug!(client_id = ?auth_ack.get("clientId"), "authenticated");

    write
        .send(Message::Text(
            json!({
                "type": "subscribe",
                "levels": levels,
                "capabilities": capabilities,
                "llm_filter": llm_filter,
            })
            .to_string(),
        ))
        .await?;

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match value.get("type").and_then(Value::as_str) {
                    Some("subscribe_ack") => {
                        eprintln!("subscribed: {value}");
                    }
                    Some("ping") => {
                        write
                            .send(Message::Text(json!({"type": "pong"}).to_string()))
                            .await?;
                    }
                    Some("pong") => {}
                    _ => println!("{value}"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
