use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::{self, unix::SignalKind};
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::{HashMap, PerCpuArray, RingBuf};
use aya::programs::Xdp;
use aya::Ebpf;

use sentinel_common::{DENYLIST_MAP, EVENTS_MAP, PROGRAM_NAME, STATS_MAP};

use sentinel::analyzer::{self, Analyzer};
use sentinel::api;
use sentinel::config::{CliArgs, Config};
use sentinel::counters::{CounterSource, KernelCounters};
use sentinel::denylist::{self, DenylistStore, KernelDenylist};
use sentinel::state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let startup_denylist = config.denylist_addrs()?;

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut bpf = Ebpf::load_file(&config.ebpf_object)
        .with_context(|| format!("failed to load eBPF object {}", config.ebpf_object))?;

    // Seeded before attach so configured sources never pass.
    let denylist_map = bpf.take_map(DENYLIST_MAP).context("DENYLIST map missing")?;
    let denylist: Arc<dyn DenylistStore> =
        Arc::new(KernelDenylist::new(HashMap::try_from(denylist_map)?));
    denylist::seed(denylist.as_ref(), &startup_denylist)?;

    let program: &mut Xdp = bpf
        .program_mut(PROGRAM_NAME)
        .context("XDP program missing from eBPF object")?
        .try_into()?;
    program.load()?;
    program
        .attach(&config.interface, config.xdp_mode.flags())
        .with_context(|| {
            format!(
                "failed to attach XDP program to {} ({:?} mode) - try --xdp-mode skb",
                config.interface, config.xdp_mode
            )
        })?;
    tracing::info!(
        "XDP classifier attached to {} ({:?} mode)",
        config.interface,
        config.xdp_mode
    );

    // ── Shared maps ───────────────────────────────────────────────────
    let stats_map = bpf.take_map(STATS_MAP).context("STATS map missing")?;
    let counters: Arc<dyn CounterSource> =
        Arc::new(KernelCounters::new(PerCpuArray::try_from(stats_map)?));

    let events_map = bpf.take_map(EVENTS_MAP).context("EVENTS map missing")?;
    let ring_buf = RingBuf::try_from(events_map)?;

    // ── State ─────────────────────────────────────────────────────────
    let telemetry = Arc::new(state::TelemetryState::new(config.recent_events));

    // ── Source Cleanup Task ───────────────────────────────────────────
    let telemetry_cleanup = telemetry.clone();
    let source_timeout = config.source_timeout;
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            telemetry_cleanup.cleanup_stale_sources(Duration::from_secs(source_timeout));
        }
    });

    // ── RingBuf Consumer ──────────────────────────────────────────────
    if config.rules.is_empty() {
        tracing::info!("No detection rules configured, denylist is managed externally");
    }
    let consumer = Analyzer::new(config.rules.clone(), telemetry.clone(), denylist.clone());
    let idle = Duration::from_millis(config.poll_interval_ms);
    tokio::spawn(analyzer::run(consumer, ring_buf, idle));

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        telemetry: telemetry.clone(),
        denylist: denylist.clone(),
        counters: Some(counters),
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state, &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Dropping `bpf` detaches the program.
    drop(bpf);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Exiting...");
}
