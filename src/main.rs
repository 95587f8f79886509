use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use keyfleet::backend::{BackendRegistry, BackendSelector};
use keyfleet::config::{Config, ConfigStore};
use keyfleet::executor::{CredentialKey, TransportFactory};
use keyfleet::orchestrator::{CreateRequest, Orchestrator};
use keyfleet::session::SessionManager;
use keyfleet::store::{CustomerStore, MemoryStore};
use keyfleet::subscription::{Aggregator, SubscriptionServer};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "keyfleet",
    about = "Provision proxy credentials across a fleet of backends",
    version
)]
struct Cli {
    /// Config file (default: ~/.config/keyfleet/config.toml)
    #[arg(
        long,
        short,
        global = true,
        env = "KEYFLEET_CONFIG",
        value_name = "PATH"
    )]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve subscriptions over HTTP
    Serve {
        /// Override `server.bind_addr`
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Create a credential on the selected backends
    Create {
        label: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value_t = 2)]
        ip_limit: u32,
        /// Traffic quota in GiB, 0 for unlimited
        #[arg(long, default_value_t = 0)]
        quota_gb: u64,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete a credential by identity or label
    Delete {
        key: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Locate a credential and print its connection descriptor
    Find {
        key: String,
        /// List every backend holding it instead of the first match
        #[arg(long)]
        everywhere: bool,
    },
    /// Push a credential's expiry forward
    Extend {
        key: String,
        #[arg(long)]
        days: u32,
    },
    /// Print the subscription of an identity
    Subscription {
        identity: Uuid,
        /// Print the base64 body served to client software
        #[arg(long)]
        encoded: bool,
    },
    /// List configured backends
    Backends,
    /// Serve `linked` as part of `master`'s subscription
    Link { master: Uuid, linked: Uuid },
    /// Remove a link
    Unlink { linked: Uuid },
}

#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Restrict to these backends (repeatable)
    #[arg(long = "backend", value_name = "NAME", conflicts_with = "primary")]
    backends: Vec<String>,
    /// Restrict to backends marked primary
    #[arg(long)]
    primary: bool,
}

impl TargetArgs {
    fn selector(&self) -> BackendSelector {
        if self.primary {
            BackendSelector::Primary
        } else if self.backends.is_empty() {
            BackendSelector::All
        } else {
            BackendSelector::Named(self.backends.clone())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    keyfleet::init_tracing(&cli.log_level);

    let path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = if path.exists() {
        Config::load_from(&path)?
    } else if cli.config.is_some() {
        bail!("Config file '{}' does not exist", path.display());
    } else {
        tracing::warn!(path = %path.display(), "No config file, using defaults");
        Config::default()
    };
    let config = ConfigStore::new(config, path);

    let orchestrator = Arc::new(build_orchestrator(&config.get())?);

    match cli.command {
        Command::Serve { bind } => serve(config, orchestrator, bind).await?,
        Command::Create {
            label,
            days,
            ip_limit,
            quota_gb,
            target,
        } => {
            let request = CreateRequest::new(label, days, ip_limit)
                .with_quota(quota_gb.saturating_mul(BYTES_PER_GB));
            let result = orchestrator
                .create_credential(&request, &target.selector())
                .await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Delete { key, target } => {
            let report = orchestrator
                .delete_credential(&CredentialKey::parse(&key), &target.selector())
                .await;
            print_json(&report)?;
        }
        Command::Find { key, everywhere } => {
            let key = CredentialKey::parse(&key);
            if everywhere {
                print_json(&orchestrator.find_everywhere(&key).await)?;
            } else {
                let Some(found) = orchestrator.find_credential(&key).await else {
                    bail!("No credential matches '{}'", key);
                };
                let backend = orchestrator.registry().get(&found.backend)?;
                print_json(&found)?;
                println!(
                    "{}",
                    keyfleet::descriptor::build(
                        found.credential.identity,
                        &found.credential.label,
                        &backend,
                        &found.profile,
                    )
                );
            }
        }
        Command::Extend { key, days } => {
            let report = orchestrator
                .extend_credential(&CredentialKey::parse(&key), days)
                .await;
            print_json(&report)?;
        }
        Command::Subscription { identity, encoded } => {
            let subscription = Aggregator::new(&orchestrator).for_customer(identity).await;
            if subscription.is_empty() {
                bail!("No backend holds {}", identity);
            }
            if encoded {
                println!("{}", subscription.encoded());
            } else {
                for descriptor in &subscription.descriptors {
                    println!("{}", descriptor);
                }
                if let Some(usage) = &subscription.usage {
                    println!("# {}", usage.header_value());
                }
            }
        }
        Command::Backends => {
            let registry = orchestrator.registry();
            for backend in registry.list() {
                println!(
                    "{:<12} {:<6} enabled={:<5} accepts_new={:<5} primary={:<5} {}",
                    backend.name,
                    if backend.is_panel() { "panel" } else { "shell" },
                    backend.enabled,
                    backend.accepts_new,
                    backend.primary,
                    backend.public_host(),
                );
            }
            for rejected in registry.rejected() {
                println!("{:<12} invalid: {}", rejected.name, rejected.reason);
            }
        }
        Command::Link { master, linked } => {
            orchestrator.store().link(master, linked)?;
            println!("{} linked to {}", linked, master);
        }
        Command::Unlink { linked } => {
            orchestrator.store().unlink(linked)?;
            println!("{} unlinked", linked);
        }
    }

    Ok(())
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let sessions = Arc::new(SessionManager::new(
        config.defaults.session_ttl(),
        config.defaults.request_timeout(),
    ));
    let executors =
        TransportFactory::new(&config.defaults, sessions).context("Failed to build HTTP client")?;

    let store: Arc<dyn CustomerStore> = match &config.store.path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let registry = BackendRegistry::from_config(config);
    for rejected in registry.rejected() {
        tracing::warn!(backend = %rejected.name, reason = %rejected.reason, "Backend skipped");
    }

    Ok(Orchestrator::from_config(
        config,
        registry,
        Arc::new(executors),
        store,
    ))
}

async fn serve(
    config: ConfigStore,
    orchestrator: Arc<Orchestrator>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let mut server_config = config.get().server;
    if let Some(bind) = bind {
        server_config.bind_addr = bind;
    }

    let server = SubscriptionServer::bind(orchestrator.clone(), &server_config)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    #[cfg(unix)]
    {
        let handle = server.handle();
        let registry = orchestrator.registry().clone();
        tokio::spawn(reload_on_hangup(config, registry, handle));
    }

    server.run().await.map_err(|e| anyhow::anyhow!(e))
}

/// Re-read the backend list on SIGHUP until the server stops.
#[cfg(unix)]
async fn reload_on_hangup(
    config: ConfigStore,
    registry: BackendRegistry,
    handle: keyfleet::subscription::ServerHandle,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "Config reload on SIGHUP unavailable");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        if handle.is_shutting_down() {
            break;
        }
        match config.reload() {
            Ok(reloaded) => {
                registry.update_config(&reloaded);
                tracing::info!(
                    path = %config.path().display(),
                    backends = reloaded.backends.len(),
                    "Backends reloaded"
                );
            }
            Err(e) => tracing::error!(error = %e, "Config reload failed, keeping current backends"),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
