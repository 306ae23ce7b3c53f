//! phx-client - command-line Phoenix Channels client.
//!
//! Connects to a Phoenix socket, joins one topic, optionally pushes an event,
//! and prints every broadcast on the topic until Ctrl-C. See the
//! `phoenix_client` library for the protocol implementation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phoenix_client::{ChannelState, ConnectionState, Socket, SocketConfig};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "phx-client")]
#[command(version, about = "Phoenix Channels client", long_about = None)]
struct Cli {
    /// JSON config file (endpoint, params, timings)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a topic and print its broadcasts until Ctrl-C
    Listen {
        /// Socket endpoint, e.g. ws://localhost:4000/socket (overrides config)
        #[arg(long)]
        endpoint: Option<String>,
        /// Connection parameter, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Topic to join
        topic: String,
        /// Join payload (JSON)
        #[arg(long, default_value = "{}")]
        join_payload: String,
        /// Event to push once joined
        #[arg(long)]
        push: Option<String>,
        /// Payload for --push (JSON)
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Broadcast event to print, repeatable
        #[arg(long = "event", default_values_t = vec!["shout".to_string()])]
        events: Vec<String>,
        /// Print every broadcast on the topic, whatever its event
        #[arg(long, conflicts_with = "events")]
        all: bool,
    },
    /// Print the effective configuration as JSON
    Config {
        /// Socket endpoint (overrides config)
        #[arg(long)]
        endpoint: Option<String>,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

fn load_config(path: Option<&PathBuf>, endpoint: Option<String>) -> Result<SocketConfig> {
    let mut config = match path {
        Some(path) => SocketConfig::load(path)?,
        None => {
            let mut config = SocketConfig::new("ws://localhost:4000/socket");
            config.apply_env_overrides();
            config
        }
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    Ok(config)
}

async fn listen(
    config: SocketConfig,
    topic: String,
    join_payload: Value,
    push: Option<(String, Value)>,
    events: Option<Vec<String>>,
) -> Result<()> {
    let socket = Socket::new(config)?;
    socket.connect()?;

    let channel = socket.channel(topic.clone()).await?;
    match events {
        Some(events) => {
            for event in events {
                let name = event.clone();
                channel.on(event, move |payload| println!("[{name}] {payload}"))?;
            }
        }
        None => {
            let name = topic.clone();
            channel.on_any(move |event, payload| println!("[{name} {event}] {payload}"))?;
        }
    }

    channel
        .join(join_payload)
        .receive("ok", |resp| log::info!("Joined: {}", resp))
        .receive("error", |resp| log::warn!("Join rejected: {}", resp))
        .receive("timeout", |_| log::warn!("Join timed out; retrying"))
        .send()
        .await?;

    if let Some((event, payload)) = push {
        let name = event.clone();
        channel
            .push(event, payload)
            .receive("ok", move |resp| println!("[{name} reply] {resp}"))
            .receive("error", |resp| log::warn!("Push rejected: {}", resp))
            .receive("timeout", |_| log::warn!("Push timed out"))
            .send()
            .await?;
    }

    println!("Listening on {topic}. Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Shutting down...");
    if channel.state() == ChannelState::Joined && socket.state() == ConnectionState::Open {
        channel.leave().timeout(Duration::from_secs(2)).send().await?;
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            channel.wait_for_state(ChannelState::Closed),
        )
        .await;
    }
    socket.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            endpoint,
            params,
            topic,
            join_payload,
            push,
            payload,
            events,
            all,
        } => {
            let mut config = load_config(cli.config.as_ref(), endpoint)?;
            config.params.extend(params);
            let join_payload = parse_json(&join_payload, "--join-payload")?;
            let push = match push {
                Some(event) => Some((event, parse_json(&payload, "--payload")?)),
                None => None,
            };
            let events = (!all).then_some(events);
            listen(config, topic, join_payload, push, events).await?;
        }
        Commands::Config { endpoint } => {
            let config = load_config(cli.config.as_ref(), endpoint)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
