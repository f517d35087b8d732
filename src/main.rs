use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use consul_coordinator::agent::listener::{self, ServiceInfo};
use consul_coordinator::agent::registrar::ServiceRegistrar;
use consul_coordinator::agent::types::RegistrationState;
use consul_coordinator::backend::http::HttpBackend;
use consul_coordinator::backend::memory::InMemoryBackend;
use consul_coordinator::backend::{SessionBehavior, SharedBackend};
use consul_coordinator::config::CoordinatorConfig;
use consul_coordinator::session::lock::LockCoordinator;
use consul_coordinator::shutdown;
use consul_coordinator::watch::types::WatchTarget;
use consul_coordinator::watch::watcher::{BlockingWatcher, LoggingHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "consul-coordinator", about = "Watches, locks and service registration on Consul")]
struct Cli {
    /// Agent address, `host:port` or `scheme://host:port` (default: $CONSUL_HTTP_ADDR or 127.0.0.1:8500)
    #[arg(long, global = true)]
    address: Option<String>,

    /// ACL token (default: $CONSUL_HTTP_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Maximum time a blocking query is held open by the agent
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    wait_time: Option<Duration>,

    /// Run against an in-process backend instead of a Consul agent
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Put, get and delete a key
    Kv {
        #[arg(long, default_value = "example")]
        key: String,
        #[arg(long, default_value = "whatever-value")]
        value: String,
    },
    /// Log every change of a key until Ctrl-C
    WatchKey {
        #[arg(long, default_value = "example")]
        key: String,
    },
    /// Log every change of a service's instances until Ctrl-C
    WatchService {
        #[arg(long, default_value = "example")]
        service: String,
    },
    /// Print the current instances of a service
    QueryService {
        #[arg(long, default_value = "example")]
        service: String,
    },
    /// Hold the lock on a key with a renewed session until Ctrl-C
    Lock {
        #[arg(long, default_value = "example")]
        key: String,
        #[arg(long, default_value = "whatever-value")]
        value: String,
        #[arg(long, value_parser = humantime::parse_duration)]
        session_ttl: Option<Duration>,
    },
    /// Serve HTTP on a random port and register it with a TTL check until Ctrl-C
    Register {
        #[arg(long, default_value = "example")]
        service: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = CoordinatorConfig::from_env();
    if let Some(address) = &cli.address {
        config.set_address(address);
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(wait_time) = cli.wait_time {
        config.wait_time = wait_time;
    }
    if let Command::Lock {
        session_ttl: Some(ttl),
        ..
    } = &cli.command
    {
        config.session_ttl = *ttl;
    }
    config.validate().context("invalid configuration")?;

    let backend: SharedBackend = if cli.in_memory {
        tracing::info!("Using the in-memory backend");
        Arc::new(InMemoryBackend::new())
    } else {
        tracing::info!("Using the agent at {}", config.base_url());
        Arc::new(HttpBackend::new(&config).context("create client error")?)
    };

    let root = shutdown::cancel_on_ctrl_c(CancellationToken::new());

    match cli.command {
        Command::Kv { key, value } => run_kv(backend, &key, &value).await,
        Command::WatchKey { key } => {
            run_watch(backend, WatchTarget::Key(key), &config, root).await
        }
        Command::WatchService { service } => {
            run_watch(backend, WatchTarget::Service(service), &config, root).await
        }
        Command::QueryService { service } => {
            let watcher =
                BlockingWatcher::from_config(backend, WatchTarget::Service(service), &config);
            let event = watcher.poll_once(0).await.context("query service error")?;
            tracing::info!("{}", event);
            Ok(())
        }
        Command::Lock { key, value, .. } => run_lock(backend, &key, &value, &config, root).await,
        Command::Register { service } => run_register(backend, &service, &config, root).await,
    }
}

async fn run_kv(backend: SharedBackend, key: &str, value: &str) -> anyhow::Result<()> {
    backend
        .kv_put(key, value.as_bytes())
        .await
        .context("write key error")?;
    tracing::info!("'{}' key written", key);

    let (pair, _) = backend
        .kv_get(key, Default::default())
        .await
        .context("lookup key error")?;
    match pair {
        Some(pair) => tracing::info!("'{}' key exists and its value is '{}'", key, pair.value_str()),
        None => bail!("'{}' key does not exist, something went wrong", key),
    }

    backend.kv_delete(key).await.context("delete key error")?;
    tracing::info!("'{}' key deleted", key);

    Ok(())
}

async fn run_watch(
    backend: SharedBackend,
    target: WatchTarget,
    config: &CoordinatorConfig,
    root: CancellationToken,
) -> anyhow::Result<()> {
    let watcher = BlockingWatcher::from_config(backend, target, config);
    let task = watcher.spawn(LoggingHandler, root.child_token());

    root.cancelled().await;
    let last_index = task.await.context("watcher task failed")?;
    tracing::info!("Watcher stopped at index {}", last_index);

    Ok(())
}

async fn run_lock(
    backend: SharedBackend,
    key: &str,
    value: &str,
    config: &CoordinatorConfig,
    root: CancellationToken,
) -> anyhow::Result<()> {
    let locks = LockCoordinator::new(backend);

    let held = locks
        .hold(
            key,
            value,
            config.session_ttl,
            SessionBehavior::Delete,
            config.renew_interval,
            &root,
        )
        .await
        .context("key acquire error")?;

    let Some(held) = held else {
        bail!("can't acquire '{}' key", key);
    };

    let outcome = held.run_until(&root).await;
    tracing::info!("Lock session ended: {:?}", outcome);

    if outcome.is_invalidated() {
        bail!("'{}' key lock lost while held", key);
    }

    Ok(())
}

async fn run_register(
    backend: SharedBackend,
    name: &str,
    config: &CoordinatorConfig,
    root: CancellationToken,
) -> anyhow::Result<()> {
    let (tcp, addr) = listener::bind_local().await.context("create listener error")?;
    let address = addr.ip().to_string();

    let registrar = ServiceRegistrar::from_config(backend, config);
    let service = registrar
        .run(name, &address, addr.port(), &root)
        .await
        .context("service register error")?;
    tracing::info!(
        "Registered myself as '{}' service ({})",
        name,
        RegistrationState::Healthy
    );

    let info = ServiceInfo {
        service: name.to_string(),
        address,
        port: addr.port(),
    };
    let stop_serving = root.child_token();
    let server = tokio::spawn(listener::serve(tcp, info, stop_serving.clone()));

    let state = service
        .run_until(&root)
        .await
        .context("service deregister error")?;
    tracing::info!("'{}' service {}", name, state);

    stop_serving.cancel();
    server
        .await
        .context("listener task failed")?
        .context("serve error")?;

    if state == RegistrationState::ExpiredRemoved {
        bail!("'{}' service was removed by the agent", name);
    }

    Ok(())
}
