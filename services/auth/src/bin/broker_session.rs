//! Broker session operator CLI
//!
//! Reads broker credentials from `.env`, keeps sessions in the file-backed
//! store and drives the hub's login, status and data operations.

use anyhow::{Context, Result};
use broker_auth::facade::parse_request;
use broker_auth::{Broker, BrokerError, BrokerHub, CredentialRecord, DataKind, HubConfig, LoginStep};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Broker session CLI
#[derive(Parser)]
#[clap(name = "broker-session")]
#[clap(about = "Log in to brokers and inspect account data")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// TOML configuration file; `.env` / environment when absent
    #[clap(long, global = true)]
    config: Option<String>,

    /// User the session belongs to
    #[clap(long, short = 'u', global = true, default_value = "default")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to a broker
    Login {
        /// kite, dhan or angel
        broker: Broker,

        /// Keep the session across restarts
        #[clap(long)]
        remember: bool,

        /// Provider token from the redirect callback; prompted for when absent
        #[clap(long)]
        token: Option<String>,
    },

    /// Show connection status
    Status {
        /// Broker to check; all when absent
        broker: Option<Broker>,
    },

    /// Fetch orders, positions, trades or all three
    Fetch {
        /// kite, dhan or angel
        broker: String,

        /// orders, positions, trades or all
        #[clap(default_value = "all")]
        kind: String,
    },

    /// Extend a session's expiry
    Refresh { broker: Broker },

    /// Forget a session
    Disconnect { broker: Broker },

    /// List remembered sessions
    Sessions {
        /// Also delete expired sessions
        #[clap(long)]
        purge: bool,
    },

    /// Print the current one-time code for a broker's TOTP seed
    Totp { broker: Broker },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_token() -> Result<String> {
    eprintln!("Paste the token from the redirect URL:");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read token from stdin")?;
    Ok(line.trim().to_string())
}

/// Register whatever credentials the environment holds
async fn register_from_env(hub: &BrokerHub, user: &str) {
    for broker in Broker::ALL {
        match hub
            .register_credentials(broker, user, CredentialRecord::from_env(broker))
            .await
        {
            Ok(mode) => info!("{} credentials loaded ({:?})", broker, mode),
            Err(e) => warn!("{} not configured: {}", broker, e),
        }
    }
}

async fn run(hub: &BrokerHub, user: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Login {
            broker,
            remember,
            token,
        } => match hub.begin_login(broker, user, remember).await? {
            LoginStep::Established(_) => {
                print_json(&hub.status(broker, user).await?)?;
            }
            LoginStep::Redirect { url, correlation } => {
                eprintln!("Open this URL to log in:\n{url}");
                let token = match token {
                    Some(token) => token,
                    None => read_token().await?,
                };
                let summary = hub.complete_login(broker, &correlation, &token).await?;
                print_json(&summary)?;
            }
        },
        Commands::Status { broker } => {
            let brokers = broker.map_or_else(|| Broker::ALL.to_vec(), |b| vec![b]);
            for broker in brokers {
                println!("{broker}:");
                print_json(&hub.status(broker, user).await?)?;
            }
        }
        Commands::Fetch { broker, kind } => {
            if kind.eq_ignore_ascii_case("all") {
                let broker: Broker = broker.parse()?;
                let snapshot = hub.fetch_all(broker, user).await?;
                for kind in DataKind::ALL {
                    println!("{kind}:");
                    print_json(&snapshot.get(kind))?;
                }
            } else {
                let (broker, kind) = parse_request(&broker, &kind)?;
                print_json(&hub.fetch(broker, user, kind).await?)?;
            }
        }
        Commands::Refresh { broker } => {
            let expires_at = hub.refresh_session(broker, user).await?;
            println!("{broker} session for {user} now expires at {expires_at}");
        }
        Commands::Disconnect { broker } => {
            hub.disconnect(broker, user).await?;
            println!("{broker} disconnected for {user}");
        }
        Commands::Sessions { purge } => {
            if purge {
                let removed = hub.purge_expired().await?;
                info!("Purged {} expired sessions", removed);
            }
            print_json(&hub.saved_sessions().await?)?;
        }
        Commands::Totp { broker } => {
            println!("{}", hub.current_totp(broker, user).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker_auth=info".parse()?)
                .add_directive("broker_session=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            dotenv::dotenv().ok();
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            HubConfig::from_toml_str(&raw)?
        }
        None => HubConfig::from_env_file()?,
    };

    let hub = BrokerHub::with_file_store(config)?;
    hub.warm_start().await?;
    register_from_env(&hub, &cli.user).await;

    let result = run(&hub, &cli.user, cli.command).await;
    if let Err(err) = &result
        && let Some(broker_err) = err.downcast_ref::<BrokerError>()
        && broker_err.needs_reconnect()
        && let Some(broker) = broker_err.broker()
    {
        eprintln!("Reconnect with: broker-session login {broker}");
    }
    hub.shutdown().await;
    result
}
