use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pilotctl_crypto::{generate_key_files, KeySource, KeyStore};
use pilotctl_events::PublisherConfig;
use pilotctl_server::config::ServiceConfig;
use pilotctl_server::server;
use tracing_subscriber::EnvFilter;

/// Pilot control service: job dispatch and event relay for host agents.
#[derive(Parser, Debug)]
#[command(name = "pilotctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service
    Serve(ServeArgs),

    /// Write a new signing and verification key pair
    Keygen {
        /// Directory to write the key files into
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Encrypt the signing key with this passphrase
        #[arg(long, env = "PILOT_CTL_SIGN_KEY_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "PILOT_CTL_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// SQLite database path
    #[arg(long, env = "PILOT_CTL_DB_PATH", default_value = "pilotctl.db")]
    db_path: String,

    /// Seconds between pilot pings
    #[arg(long, env = "PILOT_CTL_PING_INTERVAL_SECS", default_value_t = 60)]
    ping_interval_secs: u64,

    /// Passphrase protecting the signing key file
    #[arg(long, env = "PILOT_CTL_SIGN_KEY_PASSPHRASE", hide_env_values = true)]
    sign_key_passphrase: Option<String>,

    /// Extra key directories, searched before the defaults
    #[arg(long = "key-dir", env = "PILOT_CTL_KEY_DIRS", value_delimiter = ':')]
    key_dirs: Vec<PathBuf>,

    /// Event receiver list; searched for when not given
    #[arg(long, env = "PILOT_CTL_RECEIVERS_FILE")]
    receivers_file: Option<PathBuf>,

    /// Maximum concurrent event deliveries
    #[arg(long, env = "PILOT_CTL_PUBLISH_CONCURRENCY")]
    publish_concurrency: Option<usize>,
}

impl ServeArgs {
    fn into_config(self) -> ServiceConfig {
        let key_sources = self
            .key_dirs
            .into_iter()
            .map(KeySource::Dir)
            .chain(std::iter::once(KeySource::Env("PILOT_CTL".to_string())))
            .chain(KeyStore::default_sources())
            .collect();

        ServiceConfig {
            bind_addr: self.bind,
            db_path: self.db_path,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            key_sources,
            sign_key_passphrase: self.sign_key_passphrase,
            receivers_file: self.receivers_file,
            publisher: PublisherConfig {
                concurrency: self.publish_concurrency,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.into_config();
            tracing::debug!(?config, "starting");
            server::run(config)
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("service failed")
        }
        Commands::Keygen { dir, passphrase } => {
            let (sign, verify) = generate_key_files(&dir, passphrase.as_deref())
                .with_context(|| format!("cannot generate keys in {}", dir.display()))?;
            println!("signing key:      {}", sign.display());
            println!("verification key: {}", verify.display());
            Ok(())
        }
    }
}
