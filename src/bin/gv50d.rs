//! Process entry point: CLI parsing, configuration resolution, component
//! wiring, and the accept/sweep/shutdown loops (SPEC_FULL.md §2.1).
//!
//! Everything here is bootstrap glue — the core (codec/parser/reducer/
//! dispatcher/registry/connection) is a library and doesn't know this
//! binary exists. Grounded on the original `gv50/main.py` /
//! `start_service.py` sequence (parse config, construct the singletons,
//! start the TCP server, block until a shutdown signal) and, for the signal
//! handling itself, on the `tokio::select!` shutdown idiom used broadly
//! across async Rust servers.

use anyhow::Context;
use clap::Parser;
use gv50::config::{Cli, Command, Config};
use gv50::connection::{self, ConnectionContext};
use gv50::dispatcher::Dispatcher;
use gv50::notify::{LoggingGateway, NotificationGateway, NullGateway};
use gv50::reducer::ReducerConfig;
use gv50::registry::Registry;
use gv50::store::{self, Store};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level.to_string());
    env_logger::Builder::from_env(env).init();
}

fn bind_listener(config: &Config) -> anyhow::Result<std::net::TcpListener> {
    let addr = SocketAddr::new(config.listen_ip, config.listen_port);
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("creating listening socket")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).context("binding listen address")?;
    // `max_connections` doubles as the listen backlog (SPEC_FULL.md §6.1):
    // the OS accept queue need not outgrow the hard cap we enforce anyway.
    socket
        .listen(config.max_connections as i32)
        .context("listening on socket")?;
    Ok(socket.into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => log::warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received SIGINT"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}

async fn run_sweeper(registry: Arc<Registry>, timeout: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stale = registry.sweep(timeout).await;
                for token in stale {
                    token.cancel();
                }
            }
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = store::open_store(&config.persistence_uri, &config.persistence_db)
        .await
        .context("opening persistence backend")?;
    let notifier: Arc<dyn NotificationGateway> = if config.notifications_enabled {
        Arc::new(LoggingGateway)
    } else {
        Arc::new(NullGateway)
    };
    let registry = Arc::new(Registry::new());
    let dispatcher = Arc::new(Dispatcher::new(&config));
    let ctx = Arc::new(ConnectionContext {
        registry: Arc::clone(&registry),
        store,
        notifier,
        dispatcher,
        reducer_config: ReducerConfig {
            low_battery_volts: config.low_battery_volts,
        },
        connection_timeout: Duration::from_secs(config.connection_timeout_s),
        default_topic: config.default_topic.clone(),
    });

    let std_listener = bind_listener(&config)?;
    let listener = TcpListener::from_std(std_listener)?;
    log::info!("listening on {}:{}", config.listen_ip, config.listen_port);

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(config.connection_timeout_s),
        shutdown.clone(),
    ));

    loop {
        tokio::select! {
            biased;
            _ = shutdown_signal() => {
                log::info!("shutdown signal received, refusing new connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if !config.is_ip_allowed(&peer.ip()) {
                            log::warn!("rejected connection from disallowed IP {}", peer.ip());
                            drop(stream);
                            continue;
                        }
                        if registry.connection_count().await >= config.max_connections {
                            log::warn!("rejected connection from {peer}: at max_connections");
                            drop(stream);
                            continue;
                        }
                        let ctx = Arc::clone(&ctx);
                        tracker.spawn(async move {
                            connection::handle_connection(ctx, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        // Transient accept errors (e.g. EMFILE) must never
                        // bring the server down (SPEC_FULL.md §7).
                        log::error!("accept error: {e}, backing off 2s");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    shutdown.cancel();
    let _ = sweeper.await;
    registry.cancel_all().await;
    tracker.close();

    let grace = Duration::from_secs(config.shutdown_grace_s);
    tokio::select! {
        _ = tracker.wait() => log::info!("all connections drained"),
        _ = tokio::time::sleep(grace) => {
            log::warn!("shutdown grace period elapsed; abandoning in-flight connections");
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config().context("resolving configuration")?;
    init_logging(&config.log_level);

    match cli.command {
        Some(Command::CheckConfig) => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Some(Command::Serve) | None => {
            let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            runtime.block_on(run_server(config))
        }
    }
}
