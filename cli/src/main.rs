// loopmix: mix network node CLI
//
// Runs one participant per process: a mix, a provider, a client or the
// benchmark client. Participants find each other through a shared directory.

mod config;
mod directory;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use loopmix_core::bench::{format_timestamp, BenchClient, BenchConfig};
use loopmix_core::descriptor::{ParticipantDescriptor, ParticipantKind};
use loopmix_core::store::Directory;
use loopmix_core::{ClientPipeline, MixnetError, NodeKeys, RelayEngine, Role, TcpTransport, Topology, TopologyHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use directory::SharedDirectory;

#[derive(Parser)]
#[command(name = "loopmix")]
#[command(about = "Loopmix: Loopix-style mix network", long_about = None)]
#[command(version)]
struct Cli {
    /// Participant directory database (overrides the config file)
    #[arg(long, global = true)]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mix node
    Mix(NodeArgs),
    /// Run a provider (mix plus mailboxes for its clients)
    Provider(NodeArgs),
    /// Run a client attached to a provider
    Client {
        #[command(flatten)]
        node: NodeArgs,
        /// Provider holding this client's mailbox
        #[arg(long)]
        provider: String,
    },
    /// Send a fixed number of messages at a fixed interval, cover traffic off
    Bench {
        #[arg(long, default_value = "BenchClient")]
        id: String,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "0")]
        port: u16,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        messages: usize,
        #[arg(long = "interval-ms")]
        interval_ms: u64,
        /// Send one pre-generated packet over and over
        #[arg(long)]
        pregen: bool,
        #[arg(long, default_value = "BenchmarkClientRecipient")]
        recipient: String,
        /// Where to write the summary
        #[arg(long, default_value = loopmix_core::bench::SUMMARY_FILE_NAME)]
        summary: PathBuf,
    },
    /// Show configuration
    Config,
}

#[derive(Args)]
struct NodeArgs {
    #[arg(long)]
    id: String,
    /// Host published in the directory
    #[arg(long)]
    host: String,
    #[arg(long)]
    port: u16,
    /// Layer published in the directory (mixes and providers)
    #[arg(long)]
    layer: Option<u32>,
    /// Presence / metrics registry base URL (overrides the config file)
    #[arg(long)]
    registry: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The benchmark keeps stdout quiet so logging does not skew timings
    let default_filter = match cli.command {
        Commands::Bench { .. } => "warn",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::Config::load()?;
    let directory_path = match cli.directory {
        Some(path) => path,
        None => config.directory_path()?,
    };
    let directory = Arc::new(SharedDirectory::new(directory_path));

    match cli.command {
        Commands::Mix(node) => cmd_relay(&config, directory, node, ParticipantKind::Mix).await,
        Commands::Provider(node) => cmd_relay(&config, directory, node, ParticipantKind::Provider).await,
        Commands::Client { node, provider } => cmd_client(&config, directory, node, provider).await,
        Commands::Bench {
            id,
            host,
            port,
            provider,
            messages,
            interval_ms,
            pregen,
            recipient,
            summary,
        } => {
            let bench = BenchConfig {
                messages,
                interval: Duration::from_millis(interval_ms),
                pregen,
                recipient_id: recipient,
                summary_path: summary,
            };
            cmd_bench(&config, directory, id, host, port, provider, bench).await
        }
        Commands::Config => cmd_config(&config, &directory),
    }
}

/// Configuration problems point at the config file; other failures keep
/// their own category
fn startup_error(what: &str, err: impl Into<MixnetError>) -> anyhow::Error {
    let err = err.into();
    if err.is_fatal() {
        anyhow::anyhow!("{}: {} (check `loopmix config`)", what, err)
    } else {
        anyhow::anyhow!("{}: {}", what, err)
    }
}

fn publish(directory: &SharedDirectory, descriptor: &ParticipantDescriptor) -> Result<()> {
    directory
        .put(descriptor)
        .with_context(|| format!("Failed to publish {} to {}", descriptor.id, directory.path().display()))
}

fn load_topology(directory: &SharedDirectory) -> Result<Topology> {
    Topology::load(directory).with_context(|| format!("Failed to load topology from {}", directory.path().display()))
}

async fn cmd_relay(
    config: &config::Config,
    directory: Arc<SharedDirectory>,
    node: NodeArgs,
    kind: ParticipantKind,
) -> Result<()> {
    let keys = NodeKeys::generate();
    let mut descriptor = keys.descriptor(node.id.clone(), kind, node.host.clone(), node.port.to_string());
    if let Some(layer) = node.layer {
        descriptor = descriptor.with_layer(layer);
    }

    let role = match kind {
        ParticipantKind::Provider => {
            let mailbox = config.mailbox_config();
            mailbox
                .validate()
                .map_err(|e| startup_error("Invalid mailbox configuration", e))?;
            Role::provider_with_config(mailbox)
        }
        _ => Role::Mix,
    };
    let relay_config = config.relay_config(format!("0.0.0.0:{}", node.port), node.registry);

    let engine = RelayEngine::new(
        descriptor.clone(),
        keys,
        role,
        Arc::new(TcpTransport::new()),
        relay_config,
    );
    let local_addr = engine
        .start()
        .await
        .map_err(|e| startup_error("Failed to start relay", e))?;
    publish(&directory, &descriptor)?;

    println!("{} {} {} listening on {}", "✓".green(), kind, node.id.bright_cyan(), local_addr);
    println!("  Public key: {}", hex::encode(&descriptor.public_key).bright_yellow());
    println!("  Published:  {}", descriptor.address());
    println!();
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    println!("Shutting down...");
    engine.shutdown().await;

    let stats = engine.stats();
    println!(
        "{} received {}, forwarded {}, delivered {}, dropped cover {}",
        "✓".green(),
        stats.received,
        stats.forwarded,
        stats.delivered,
        stats.dropped_cover
    );
    Ok(())
}

async fn cmd_client(
    config: &config::Config,
    directory: Arc<SharedDirectory>,
    node: NodeArgs,
    provider: String,
) -> Result<()> {
    let keys = NodeKeys::generate();
    let client_config = config.client_config(node.id.clone(), node.host.clone(), node.port.to_string(), provider);

    let topology = TopologyHandle::new(load_topology(&directory)?);
    let (mut client, mut received) = ClientPipeline::start(
        client_config,
        keys,
        Arc::new(TcpTransport::new()),
        topology,
        Some(directory.clone() as Arc<dyn Directory>),
    )
    .map_err(|e| startup_error("Failed to start client", e))?;
    let local_addr = client
        .listen(config.relay_config(format!("0.0.0.0:{}", node.port), None))
        .await
        .map_err(|e| startup_error("Failed to start client listener", e))?;
    publish(&directory, client.descriptor())?;

    println!("{} Client {} listening on {}", "✓".green(), node.id.bright_cyan(), local_addr);
    println!("  Public key: {}", hex::encode(&client.descriptor().public_key).bright_yellow());
    println!();
    println!("{}", "Commands:".bold());
    println!("  {} <recipient> <message>", "send".bright_green());
    println!("  {}                       ", "stats".bright_green());
    println!("  {}                        ", "quit".bright_green());
    println!();

    use tokio::io::AsyncBufReadExt;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            message = received.recv() => {
                let Some(message) = message else { break };
                let text = String::from_utf8_lossy(&message.body);
                println!("{} {}: {}", "←".bright_blue(), message.sender.bright_cyan(), text);
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("stdin: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line == "quit" || line == "exit" {
                    break;
                }
                if line == "stats" {
                    println!("{:?}", client.stats());
                    continue;
                }
                if let Some(rest) = line.strip_prefix("send ") {
                    let Some((recipient, text)) = rest.split_once(' ') else {
                        println!("Usage: send <recipient> <message>");
                        continue;
                    };
                    match client.send(text.as_bytes(), recipient).await {
                        Ok(()) => println!("{} Sent", "✓".green()),
                        Err(e) => println!("{} {}", "✗".red(), e),
                    }
                    continue;
                }
                if !line.is_empty() {
                    println!("Try: send, stats, quit");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down...");
    client.shutdown().await;
    Ok(())
}

async fn cmd_bench(
    config: &config::Config,
    directory: Arc<SharedDirectory>,
    id: String,
    host: String,
    port: u16,
    provider: String,
    bench: BenchConfig,
) -> Result<()> {
    let client_config = BenchConfig::client_config(config.client_config(id, host, port.to_string(), provider));
    let topology = TopologyHandle::new(load_topology(&directory)?);

    let (client, _received) = ClientPipeline::start(
        client_config,
        NodeKeys::generate(),
        Arc::new(TcpTransport::new()),
        topology,
        None,
    )
    .map_err(|e| startup_error("Failed to start bench client", e))?;

    println!(
        "Going to try sending {} messages every {:?}",
        bench.messages, bench.interval
    );
    if bench.pregen {
        println!("Going to be sending the pre-generated packet");
    }
    let summary_path = bench.summary_path.clone();

    let summary = BenchClient::new(client, bench)
        .map_err(|e| startup_error("Invalid benchmark configuration", e))?
        .run()
        .await
        .context("Benchmark aborted")?;

    println!("Summary written to {}", summary_path.display());
    println!("Earliest timestamp: {}", format_timestamp(&summary.earliest));
    println!("Latest timestamp: {}", format_timestamp(&summary.latest));
    println!("timedelta: {}ms", summary.span().num_milliseconds());
    Ok(())
}

fn cmd_config(config: &config::Config, directory: &SharedDirectory) -> Result<()> {
    println!("{}", "Configuration".bold());
    println!("  {:<30} {}", "config_file".bright_cyan(), config::Config::config_file()?.display());
    println!("  {:<30} {}", "directory".bright_cyan(), directory.path().display());
    for (key, value) in config.list() {
        println!("  {:<30} {}", key.bright_cyan(), value);
    }
    Ok(())
}
