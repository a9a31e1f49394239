//! tunnelbox command line
//!
//! - `check-config`: load and validate a configuration file
//! - `example-config`: print or write an example configuration
//! - `probe`: negotiate a session with a server over UDP and report the result

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};
use tunnelbox::config::{init_logging, Config};
use tunnelbox::crypto::SystemRandomSource;
use tunnelbox::session::TlsSetup;
use tunnelbox::transport::{MemoryTunnel, UdpLink};
use tunnelbox::{Session, SessionEvent, SessionHandle};

#[derive(Parser, Debug)]
#[command(name = "tunnelbox")]
#[command(about = "Secure tunnel engine: control channel, data channel and data path")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tunnelbox.toml", global = true)]
    config: PathBuf,

    /// Log level (overrides the configuration)
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration file
    CheckConfig,
    /// Print an example configuration, or write it to a file
    ExampleConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Negotiate a session with a server and report its keys
    Probe {
        /// Server address
        server: SocketAddr,
        /// Local bind address
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// Also run one re-key before closing
        #[arg(long)]
        rekey: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::ExampleConfig { output } = &args.command {
        return example_config(output.as_ref());
    }

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging).context("Failed to initialise logging")?;

    match args.command {
        Command::CheckConfig => {
            info!(path = %args.config.display(), "configuration is valid");
            Ok(())
        }
        Command::Probe { server, bind, rekey } => probe(&config, server, bind, rekey).await,
        Command::ExampleConfig { .. } => Ok(()),
    }
}

fn example_config(output: Option<&PathBuf>) -> Result<()> {
    let config = Config::example();
    match output {
        Some(path) => {
            config.save(path)?;
            println!("Example configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

async fn probe(config: &Config, server: SocketAddr, bind: SocketAddr, rekey: bool) -> Result<()> {
    let tls = TlsSetup::from_config(&config.control).context("Failed to set up TLS")?;
    let random = SystemRandomSource::probe(32).context("Random source unavailable")?;
    let session = Session::new(config, tls, Arc::new(random), Instant::now())?;

    let link = UdpLink::connect(bind, server)
        .await
        .context("Failed to open UDP link")?;
    info!(local = ?link.local_addr().ok(), %server, "probing");

    // No OS tunnel: packets are only needed to prove the data path works.
    let (tun, _tun_handle) = MemoryTunnel::new(config.data.mtu, 64);
    let (handle, mut events) = SessionHandle::new(session);
    let runner = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.run(Arc::new(link), Arc::new(tun)).await })
    };

    let deadline = config.session.connection_timeout() + Duration::from_secs(1);
    let mut rekey_pending = rekey;
    let outcome = loop {
        let event = match timeout(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break Err(anyhow!("session ended without an event")),
            Err(_) => break Err(anyhow!("no answer within {:?}", deadline)),
        };
        match event {
            SessionEvent::Established { key_id } => {
                println!("established (key {})", key_id);
                if !rekey_pending {
                    break Ok(());
                }
                rekey_pending = false;
                handle.request_rekey().await;
            }
            SessionEvent::Rekeyed { key_id } => {
                println!("re-keyed (key {})", key_id);
                break Ok(());
            }
            SessionEvent::KeyRetired { .. } => {}
            SessionEvent::Closed { reason } => break Err(anyhow!("session closed: {:?}", reason)),
            SessionEvent::Failed(kind) => break Err(anyhow!("session failed: {}", kind)),
        }
    };

    {
        let session = handle.lock().await;
        let stats = session.stats();
        info!(
            packets_out = stats.packets_out,
            packets_in = stats.packets_in,
            dropped = stats.dropped(),
            "data path stats"
        );
    }
    handle.shutdown().await;
    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "session driver stopped with an error"),
        Err(e) => warn!(error = %e, "session driver panicked"),
    }
    outcome
}
