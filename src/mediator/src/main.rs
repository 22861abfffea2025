//! Mediator: client-side ad mediation host.
//!
//! Loads placements, wires breakers, tracker, network monitor and adapters,
//! runs mediation passes, and prints the operational report.

mod simulate;

use anyhow::Context;
use clap::Parser;
use mediator_arbiter::{AdapterRegistry, AuctionCallout, MediationArbiter, RequestMeta};
use mediator_auction::{AuctionClient, HttpTransport, ReqwestTransport};
use mediator_core::config::{AppConfig, PlacementConfig};
use mediator_core::{AdapterFamily, ConsentSnapshot, RequestContext, SystemClock};
use mediator_resilience::{
    CircuitBreaker, CircuitBreakerRegistry, FillOutcomeTracker, NetworkMonitor, OperationalReport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mediator")]
#[command(about = "Client-side ad mediation: waterfall and concurrent arbitration across demand sources")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still apply)
    #[arg(long, env = "MEDIATOR_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "MEDIATOR__NODE_ID")]
    node_id: Option<String>,

    /// Only run this placement
    #[arg(long)]
    placement: Option<String>,

    /// Mediation passes to run per placement
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// Serve the auction from a scripted in-memory endpoint
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Auction endpoint (overrides config)
    #[arg(long, env = "MEDIATOR__AUCTION__ENDPOINT")]
    endpoint: Option<String>,

    /// Expose Prometheus metrics on this port
    #[arg(long, env = "MEDIATOR__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Print the operational report as JSON when done
    #[arg(long, default_value_t = false)]
    report: bool,
}

/// Install the global recorder and spawn the scrape listener on the current
/// runtime. Must be called from inside the tokio runtime.
fn start_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(%addr, "metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediator=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("mediator starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(endpoint) = cli.endpoint {
        config.auction.endpoint = endpoint;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }
    if config.placements.is_empty() {
        info!("no placements configured, using demo placements");
        config.placements = simulate::demo_placements();
    }
    config.validate().context("invalid configuration")?;

    let placements: Vec<PlacementConfig> = config
        .placements
        .iter()
        .filter(|p| cli.placement.as_deref().map_or(true, |id| p.placement_id == id))
        .cloned()
        .collect();
    if placements.is_empty() {
        anyhow::bail!("no placement matches {:?}", cli.placement);
    }

    info!(
        node_id = %config.node_id,
        placements = placements.len(),
        passes = cli.passes,
        simulate = cli.simulate,
        endpoint = %config.auction.endpoint,
        "configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(SocketAddr::from(([0, 0, 0, 0], config.metrics.port))) {
            error!(error = %e, "failed to start metrics exporter");
        }
    }

    let clock = SystemClock::shared();
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone(), clock.clone()));
    let tracker = Arc::new(FillOutcomeTracker::new(config.tracker.clone(), clock.clone()));
    let network = Arc::new(NetworkMonitor::optimistic(config.network.clone(), clock.clone()));

    let transport: Arc<dyn HttpTransport> = if cli.simulate {
        Arc::new(simulate::auction_transport())
    } else {
        Arc::new(ReqwestTransport::new().context("building HTTP client")?)
    };
    let context = RequestContext {
        device: [("os".to_string(), std::env::consts::OS.to_string())].into(),
        app: [("node_id".to_string(), config.node_id.clone())].into(),
        user: Default::default(),
    };
    // The endpoint breaker is separate from the per-source breakers so the
    // arbiter's verdict for the source is not counted twice.
    let auction = Arc::new(
        AuctionClient::new(
            &config.auction,
            transport,
            Arc::new(CircuitBreaker::new(
                "auction_endpoint",
                config.breaker.clone(),
                clock.clone(),
            )),
            network.clone(),
            clock.clone(),
        )
        .with_context(context),
    );

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(AuctionCallout::new(auction, clock.clone())));
    for (seed, family) in [
        AdapterFamily::AdMob,
        AdapterFamily::AppLovin,
        AdapterFamily::UnityAds,
        AdapterFamily::IronSource,
        AdapterFamily::MetaAudienceNetwork,
        AdapterFamily::Custom,
    ]
    .into_iter()
    .enumerate()
    {
        registry.register(Arc::new(simulate::SimulatedCallout::new(
            family,
            config.arbiter.rng_seed.unwrap_or(0) ^ seed as u64,
        )));
    }

    let arbiter = Arc::new(MediationArbiter::new(
        config.arbiter.clone(),
        breakers.clone(),
        tracker.clone(),
        network.clone(),
        clock.clone(),
    ));

    // Retention pass for the tracker's raw event log
    let tracker_for_prune = tracker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = tracker_for_prune.prune();
            if evicted > 0 {
                info!(evicted, "tracker events pruned");
            }
        }
    });

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight passes");
            on_signal.cancel();
        }
    });

    let mut set = JoinSet::new();
    for placement in placements {
        let sources = placement.sources()?;
        registry.ensure_covers(&sources)?;
        let arbiter = arbiter.clone();
        let registry = registry.clone();
        let cancel = shutdown.child_token();
        let passes = cli.passes;

        set.spawn(async move {
            let ctx = placement.pass_context();
            let mut fills = 0u32;
            for _ in 0..passes {
                if cancel.is_cancelled() {
                    break;
                }
                let meta = RequestMeta::new(placement.placement_id.clone(), placement.ad_format)
                    .with_floor(placement.floor_cpm)
                    .with_consent(ConsentSnapshot::default())
                    .with_cancel(cancel.clone());
                let outcome = arbiter
                    .run(
                        &ctx,
                        &sources,
                        placement.strategy,
                        registry.attempt_fn(meta),
                        &cancel,
                    )
                    .await;
                if outcome.is_fill() {
                    fills += 1;
                }
                info!(
                    placement_id = %outcome.placement_id,
                    strategy = outcome.strategy.as_str(),
                    result = outcome.outcome.label(),
                    winner = outcome.winner.as_deref().unwrap_or("-"),
                    attempts = outcome.attempts,
                    elapsed_ms = outcome.elapsed_ms,
                    "pass complete"
                );
            }
            (placement.placement_id, fills, passes)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((placement_id, fills, passes)) => {
                info!(placement_id = %placement_id, fills, passes, "placement finished");
            }
            Err(e) => error!(error = %e, "placement task failed"),
        }
    }

    if cli.report {
        let report = OperationalReport::collect(&tracker, &breakers, clock.wall());
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!("mediator shut down");
    Ok(())
}
