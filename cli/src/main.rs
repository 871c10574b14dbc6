// rendezvous: command-line relay and client
//
// Runs a rendezvous relay, or connects to relays to answer and send requests.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rendezvous_core::relay::RelayServerConfig;
use rendezvous_core::transport::Listener;
use rendezvous_core::{
    handler_fn, Exchange, ExchangeConfig, HandlerReply, IdentityKeys, IdentityManager,
    NackHandler, RelayServer, RequestHandler,
};
use std::sync::Arc;

/// Namespace answered by `rendezvous serve`
const ECHO_NAMESPACE: &str = "echo";

#[derive(Parser)]
#[command(name = "rendezvous")]
#[command(about = "Request/response between peers through rendezvous relays", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity information
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Run a relay server
    Relay {
        #[arg(short, long)]
        listen: Option<String>,
        /// Keep directory entries of disconnected peers
        #[arg(long)]
        no_purge: bool,
    },
    /// Connect to relays and answer echo requests
    Serve {
        #[arg(short, long = "relay")]
        relays: Vec<String>,
        /// Also relay for peers connecting to ADDR
        #[arg(short, long)]
        listen: Option<String>,
        #[arg(long)]
        insecure: bool,
    },
    /// Send one request and print the reply
    Request {
        #[arg(short, long = "relay")]
        relays: Vec<String>,
        #[arg(short, long)]
        peer: String,
        #[arg(short, long, default_value = ECHO_NAMESPACE)]
        ns: String,
        #[arg(short, long)]
        data: String,
        #[arg(long)]
        insecure: bool,
    },
    /// Resolve a peer-id to its public key through the relays
    Lookup {
        #[arg(short, long = "relay")]
        relays: Vec<String>,
        #[arg(short, long)]
        peer: String,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    Show,
    /// Replace the stored key pair (changes the peer-id)
    Regenerate,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

#[derive(Subcommand)]
enum RelayAction {
    Add { addr: String },
    Remove { addr: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Identity { action } => cmd_identity(action),
        Commands::Relay { listen, no_purge } => cmd_relay(listen, no_purge).await,
        Commands::Serve {
            relays,
            listen,
            insecure,
        } => cmd_serve(relays, listen, insecure).await,
        Commands::Request {
            relays,
            peer,
            ns,
            data,
            insecure,
        } => cmd_request(relays, peer, ns, data, insecure).await,
        Commands::Lookup { relays, peer } => cmd_lookup(relays, peer).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn open_identity(config: &config::Config) -> Result<IdentityManager> {
    IdentityManager::open_path(&config.identity_path()?).context("Failed to open identity storage")
}

/// Load the persistent identity, generating it on first use.
fn load_keys(config: &config::Config) -> Result<IdentityKeys> {
    Ok(open_identity(config)?.keys().clone())
}

/// Connect an exchange to every relay that answers.
fn client_config(config: &config::Config, insecure: bool) -> ExchangeConfig {
    ExchangeConfig {
        secure: config.exchange.secure && !insecure,
        enable_server: false,
        ..config.exchange.clone()
    }
}

/// Build the exchange and dial `relays` (or the configured ones). Zero relays
/// is only accepted when the exchange relays for others itself.
async fn connect(
    config: &config::Config,
    relays: Vec<String>,
    exchange_config: ExchangeConfig,
    handler: Arc<dyn RequestHandler>,
) -> Result<Exchange> {
    let relays = if relays.is_empty() {
        config.relays.clone()
    } else {
        relays
    };
    let standalone = exchange_config.enable_server;
    if relays.is_empty() && !standalone {
        anyhow::bail!(
            "No relays given. Use --relay ADDR or `rendezvous config relay add ADDR`"
        );
    }

    let exchange = Exchange::new(load_keys(config)?, handler, exchange_config);

    // Sessions join the failover order as their dials complete
    let dials = relays.iter().map(|addr| {
        let exchange = &exchange;
        async move { (addr, exchange.dial(addr).await) }
    });
    for (addr, result) in futures::future::join_all(dials).await {
        match result {
            Ok(session) => println!(
                "  {} {} ({})",
                "✓".green(),
                addr,
                session.relay().peer_id().dimmed()
            ),
            Err(e) => println!("  {} {}: {}", "✗".red(), addr, e),
        }
    }
    if exchange.session_count() == 0 && !standalone {
        anyhow::bail!("Could not reach any relay");
    }

    Ok(exchange)
}

fn cmd_identity(action: Option<IdentityAction>) -> Result<()> {
    let config = config::Config::load()?;
    let mut manager = open_identity(&config)?;

    if let Some(IdentityAction::Regenerate) = action {
        let old = manager.keys().peer_id();
        manager.regenerate()?;
        println!("{} Replaced identity {}", "✓".green(), old.dimmed());
        println!();
    }

    let keys = manager.keys();
    println!("{}", "Identity Information".bold());
    println!("  Peer ID:    {}", keys.peer_id().bright_cyan());
    println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
    println!(
        "  Stored in:  {}",
        config.identity_path()?.display().to_string().dimmed()
    );

    Ok(())
}

async fn cmd_relay(listen: Option<String>, no_purge: bool) -> Result<()> {
    let config = config::Config::load()?;
    let keys = Arc::new(load_keys(&config)?);
    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());

    let relay_config = RelayServerConfig {
        purge_on_disconnect: !no_purge,
        call_timeout: config.exchange.call_timeout(),
        ..RelayServerConfig::default()
    };
    let server = Arc::new(RelayServer::with_config(relay_config));
    let listener = Listener::bind(&addr, Arc::clone(&keys))
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;

    println!("{}", "Rendezvous relay".bold());
    println!("  Peer ID:   {}", keys.peer_id().bright_cyan());
    println!("  Listening: {}", listener.local_addr()?.to_string().bright_green());
    println!("  Press Ctrl+C to stop");
    println!();

    let serving = tokio::spawn(Arc::clone(&server).serve(listener));
    tokio::signal::ctrl_c().await?;
    server.stop();
    serving.await??;

    let stats = server.get_stats();
    println!("{}", "Relay statistics".bold());
    println!("  Registrations:      {}", stats.registrations);
    println!("  Lookups:            {}", stats.lookups);
    println!("  Requests forwarded: {}", stats.requests_forwarded);
    println!("  Forward failures:   {}", stats.forward_failures);

    Ok(())
}

async fn cmd_serve(relays: Vec<String>, listen: Option<String>, insecure: bool) -> Result<()> {
    let config = config::Config::load()?;
    let listen = listen.or_else(|| {
        config
            .exchange
            .enable_server
            .then(|| config.listen_addr.clone())
    });
    let exchange_config = ExchangeConfig {
        enable_server: listen.is_some(),
        ..client_config(&config, insecure)
    };

    let handler = handler_fn(|namespace, caller, payload| async move {
        if namespace != ECHO_NAMESPACE {
            tracing::debug!(caller = %caller, namespace = %namespace, "declining request");
            return Ok(HandlerReply::Nack);
        }
        println!(
            "  {} {} bytes from {}",
            "←".bright_blue(),
            payload.len(),
            caller.peer_id().bright_cyan()
        );
        Ok(HandlerReply::Result(payload))
    });

    println!("{}", "Connecting to relays...".bold());
    let exchange = connect(&config, relays, exchange_config, Arc::new(handler)).await?;

    let listener = match &listen {
        Some(addr) => Some(
            Listener::bind(addr, Arc::clone(exchange.keys()))
                .await
                .with_context(|| format!("Failed to listen on {}", addr))?,
        ),
        None => None,
    };

    println!();
    println!("Answering '{}' requests as {}", ECHO_NAMESPACE, exchange.identity().peer_id().bright_cyan());
    if let Some(listener) = &listener {
        println!("  Relaying on {}", listener.local_addr()?.to_string().bright_green());
    }
    println!("  Press Ctrl+C to stop");

    let serving = async {
        match listener {
            Some(listener) => exchange.serve(listener).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        served = serving => served?,
        signal = tokio::signal::ctrl_c() => signal?,
    }
    exchange.stop();
    Ok(())
}

async fn cmd_request(
    relays: Vec<String>,
    peer: String,
    ns: String,
    data: String,
    insecure: bool,
) -> Result<()> {
    let config = config::Config::load()?;
    let exchange = connect(
        &config,
        relays,
        client_config(&config, insecure),
        Arc::new(NackHandler),
    )
    .await?;

    let reply = exchange
        .request(peer.as_str(), &ns, data.into_bytes())
        .await
        .with_context(|| format!("Request to {} failed", peer))?;

    println!();
    match String::from_utf8(reply) {
        Ok(text) => println!("{} {}", "→".bright_green(), text),
        Err(e) => println!("{} 0x{}", "→".bright_green(), hex::encode(e.into_bytes())),
    }

    exchange.stop();
    Ok(())
}

async fn cmd_lookup(relays: Vec<String>, peer: String) -> Result<()> {
    let config = config::Config::load()?;
    let exchange = connect(
        &config,
        relays,
        client_config(&config, false),
        Arc::new(NackHandler),
    )
    .await?;

    let identity = exchange
        .get_identity(peer.as_str())
        .await
        .with_context(|| format!("Lookup of {} failed", peer))?;

    println!();
    println!("{}", "Peer Identity".bold());
    println!("  Peer ID:    {}", identity.peer_id().bright_cyan());
    println!(
        "  Public Key: {}",
        hex::encode(identity.public_key_bytes()).bright_yellow()
    );

    exchange.stop();
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            print_relays(&config);
        }

        ConfigAction::Relay { action } => match action {
            RelayAction::Add { addr } => {
                if config.add_relay(addr.clone()) {
                    config.save()?;
                    println!("{} Added relay: {}", "✓".green(), addr);
                } else {
                    println!("{}", "Relay already configured.".dimmed());
                }
            }

            RelayAction::Remove { addr } => {
                if config.remove_relay(&addr) {
                    config.save()?;
                    println!("{} Removed relay", "✓".green());
                } else {
                    anyhow::bail!("Relay not configured: {}", addr);
                }
            }

            RelayAction::List => print_relays(&config),
        },
    }

    Ok(())
}

fn print_relays(config: &config::Config) {
    println!("{}", "Relays:".bold());
    if config.relays.is_empty() {
        println!("  {}", "(none configured)".dimmed());
    } else {
        for (i, relay) in config.relays.iter().enumerate() {
            println!("  {}. {}", i + 1, relay);
        }
    }
}
