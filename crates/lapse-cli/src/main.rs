use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lapse_core::{Broker, Decoded, LapseConfig, Message};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::info;

const CONFIG_PATHS: [&str; 2] = ["lapse.toml", "/etc/lapse/lapse.toml"];

#[derive(Parser)]
#[command(name = "lapse", about = "Delayed message queue on Redis")]
struct Cli {
    /// Config file; skips the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Produce one message, optionally delayed
    Produce {
        /// Topic name
        topic: String,

        /// Message body; parsed as JSON, otherwise sent as a string
        body: String,

        /// Delay before delivery in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },

    /// Print messages from a topic as they arrive
    Consume {
        /// Topic name
        topic: String,

        /// Stop after this long without a message (0 = wait forever)
        #[arg(long, default_value = "0")]
        timeout_ms: u64,

        /// Stop after this many messages (0 = no limit)
        #[arg(long, default_value = "0")]
        count: u64,
    },
}

fn parse_body(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn read_config(path: &Path) -> Result<LapseConfig, String> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| format!("error reading {}: {e}", path.display()))?;
    toml::from_str(&contents).map_err(|e| format!("error parsing {}: {e}", path.display()))
}

/// An explicit path must exist; otherwise the first file found on the search
/// path wins, falling back to defaults.
fn load_config(explicit: Option<&Path>, search: &[&Path]) -> Result<LapseConfig, String> {
    if let Some(path) = explicit {
        let config = read_config(path)?;
        info!(path = %path.display(), "loaded configuration");
        return Ok(config);
    }

    for path in search {
        if path.exists() {
            let config = read_config(path)?;
            info!(path = %path.display(), "loaded configuration");
            return Ok(config);
        }
    }

    info!("no config file found, using defaults");
    Ok(LapseConfig::default())
}

async fn connect(config: &LapseConfig) -> Broker {
    match Broker::connect(config).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("Error: cannot start broker: {e}");
            process::exit(1);
        }
    }
}

async fn cmd_produce(broker: &Broker, topic: String, body: String, delay_ms: u64) {
    let message = Message::new(topic.clone(), parse_body(&body))
        .with_delay(Duration::from_millis(delay_ms));

    match broker.produce(message).await {
        Ok(id) if delay_ms > 0 => {
            println!("Scheduled {id} on \"{topic}\" in {delay_ms}ms")
        }
        Ok(id) => println!("Produced {id} on \"{topic}\""),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

async fn cmd_consume(broker: &Broker, topic: String, timeout_ms: u64, count: u64) {
    let mut stream = broker
        .consume(&topic)
        .stream_timeout(Duration::from_millis(timeout_ms));
    let mut received = 0u64;

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };

        match item {
            Some(Ok(Decoded::Message(message))) => match serde_json::to_string(&message) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("Error: cannot print message {}: {e}", message.id),
            },
            Some(Ok(Decoded::Raw(raw))) => println!("{raw}"),
            Some(Err(e)) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            None => break,
        }

        received += 1;
        if count > 0 && received >= count {
            break;
        }
    }

    info!(topic = %topic, received, "consumer finished");
}

#[tokio::main]
async fn main() {
    lapse_core::telemetry::init_tracing();
    let cli = Cli::parse();

    let search: Vec<&Path> = CONFIG_PATHS.into_iter().map(Path::new).collect();
    let config = match load_config(cli.config.as_deref(), &search) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let broker = connect(&config).await;

    match cli.command {
        Commands::Produce {
            topic,
            body,
            delay_ms,
        } => cmd_produce(&broker, topic, body, delay_ms).await,
        Commands::Consume {
            topic,
            timeout_ms,
            count,
        } => cmd_consume(&broker, topic, timeout_ms, count).await,
    }

    broker.shutdown().await;
}
