// Flock agent: peer listener, swarm scheduler and content store daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use flock_core::piece::DEFAULT_PIECE_LENGTH;
use flock_core::{Admission, PeerId};
use flock_agent::config;
use flock_agent::logging::init_logging;
use flock_agent::transport::{run_listener, TcpDialer};
use flock_agent::{EventProducer, Scheduler, StoreManager};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    import: Option<(PathBuf, u64)>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let mut import = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("flock-agent {}", VERSION);
                return Ok(None);
            }
            "--import" => {
                let Some(file) = args.next() else {
                    bail!("--import needs a file");
                };
                let piece_length = match args.next() {
                    Some(n) => n.parse().with_context(|| format!("bad piece length {n:?}"))?,
                    None => DEFAULT_PIECE_LENGTH,
                };
                import = Some((PathBuf::from(file), piece_length));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(Some(Args { import }))
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let cfg = config::load().context("loading config")?;
    init_logging(&cfg)?;

    let (events, mut records) = EventProducer::channel();
    let store = Arc::new(
        StoreManager::new(
            cfg.store_layout(),
            cfg.store.cache_budget_bytes,
            cfg.trash_grace(),
            events.clone(),
        )
        .context("preparing content store")?,
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::spawn(async move {
            while let Some(event) = records.recv().await {
                let record = flock_agent::events::to_json(&event);
                info!(event = event.name(), %record, "event");
            }
        });

        if let Some((file, piece_length)) = args.import {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let info = store
                .blocking(move |s| s.import(&data, piece_length))
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            info!(
                hash = %info.hash(),
                pieces = info.num_pieces(),
                link = %store.link_path(&info.hash()).display(),
                "imported"
            );
        }

        let local_peer = PeerId::generate();
        let scheduler = Scheduler::new(
            cfg.scheduler_config(),
            cfg.conn_config(),
            local_peer,
            store.clone(),
            Admission::new(
                cfg.scheduler.max_global_conns,
                cfg.scheduler.max_conns_per_swarm,
            ),
            Arc::new(TcpDialer),
            events,
        );
        info!(peer = %local_peer, version = VERSION, "flock agent starting");

        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("binding port {}", cfg.listen_port))?;
        let sched = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(listener, sched).await {
                error!(error = %e, "listener stopped");
            }
        });
        tokio::spawn(eviction_loop(store.clone(), cfg.eviction_interval()));
        tokio::spawn(sweep_loop(store.clone(), cfg.sweep_interval()));

        shutdown_signal().await?;
        info!("shutting down");
        scheduler.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

async fn eviction_loop(store: Arc<StoreManager>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match store.blocking(|s| s.run_eviction_cycle()).await {
            Ok(evicted) if !evicted.is_empty() => {
                info!(count = evicted.len(), usage = store.cache_usage(), "eviction cycle");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "eviction cycle failed"),
        }
    }
}

async fn sweep_loop(store: Arc<StoreManager>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(e) = store.blocking(|s| s.sweep_trash(SystemTime::now())).await {
            warn!(error = %e, "trash sweep failed");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
