use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kindwatch_core::{Config, GroupKind, GroupVersionKind, NamespacedName, ReconcileRequest, TrackedKey};
use kindwatch_kubehub::{dispatch, KubeEstablisher};
use kindwatch_store::TtlStore;
use kindwatch_tracker::WatchingTracker;
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

#[derive(Parser, Debug)]
#[command(name = "kindwatchctl", version, about = "kindwatch CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track dependencies and print the reconcile requests their changes trigger
    Track {
        /// Dependency as <tracked key>=<dependent>, e.g. "v1/ConfigMap:prod/settings=prod/web"
        #[arg(long = "track", required = true)]
        pairs: Vec<TrackPair>,
        /// Time-to-live of each dependency (default: KINDWATCH_TRACK_TTL_SECS or 300)
        #[arg(long = "ttl-secs")]
        ttl_secs: Option<u64>,
        /// How often dependencies are re-tracked (default: half the TTL)
        #[arg(long = "refresh-secs")]
        refresh_secs: Option<u64>,
    },
    /// Parse a tracked key and show its parts
    Parse {
        /// Tracked key, e.g. "apps/v1/Deployment:default/web"
        key: String,
    },
}

#[derive(Clone, Debug)]
struct TrackPair {
    key: TrackedKey,
    by: NamespacedName,
}

impl FromStr for TrackPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, by) = s
            .rsplit_once('=')
            .ok_or_else(|| anyhow!("invalid dependency {:?} (expect <tracked key>=<dependent>)", s))?;
        Ok(Self { key: key.parse()?, by: by.parse()? })
    }
}

#[derive(Serialize)]
struct ParsedKey {
    gvk: GroupVersionKind,
    group_kind: GroupKind,
    target: NamespacedName,
}

fn init_tracing() {
    let env = std::env::var("KINDWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINDWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KINDWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_request(output: Output, req: &ReconcileRequest) -> Result<()> {
    match output {
        Output::Human => println!("reconcile {}", req.namespaced_name),
        Output::Json => println!("{}", serde_json::to_string(req)?),
    }
    Ok(())
}

async fn track_all<S, E>(tracker: &WatchingTracker<S, E>, ctx: &CancellationToken, pairs: &[TrackPair]) -> usize
where
    S: kindwatch_store::AssociationStore,
    E: kindwatch_tracker::WatchEstablisher,
{
    let mut failed = 0;
    for p in pairs {
        if let Err(e) = tracker.track(ctx, &p.key, &p.by).await {
            error!(key = %p.key, by = %p.by, error = %e, "track failed");
            failed += 1;
        }
    }
    failed
}

async fn run_track(output: Output, pairs: Vec<TrackPair>, ttl_secs: Option<u64>, refresh_secs: Option<u64>) -> Result<()> {
    let mut cfg = Config::from_env();
    if let Some(secs) = ttl_secs {
        cfg.track_ttl = Duration::from_secs(secs);
    }
    let refresh = refresh_secs
        .map(Duration::from_secs)
        .unwrap_or(cfg.track_ttl / 2)
        .max(Duration::from_secs(1));
    info!(deps = pairs.len(), ttl_secs = cfg.track_ttl.as_secs(), refresh_secs = refresh.as_secs(), "track invoked");

    let (observed_tx, observed_rx) = mpsc::channel(cfg.queue_cap);
    let (request_tx, mut request_rx) = mpsc::channel(cfg.queue_cap);
    let establisher = KubeEstablisher::try_default(observed_tx).await?;
    let tracker = Arc::new(WatchingTracker::new(TtlStore::from_config(&cfg), establisher, info_span!("tracker")));
    let dispatcher = tokio::spawn(dispatch(tracker.clone(), observed_rx, request_tx));

    let ctx = CancellationToken::new();
    let mut ticker = tokio::time::interval(refresh);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received; stopping watches");
                break;
            }
            _ = ticker.tick() => {
                let failed = track_all(tracker.as_ref(), &ctx, &pairs).await;
                let kinds: Vec<String> = tracker.active_kinds().into_iter().map(|(_, gvk)| gvk.key()).collect();
                info!(failed, watching = ?kinds, "dependencies tracked");
            }
            maybe = request_rx.recv() => {
                match maybe {
                    Some(req) => print_request(output, &req)?,
                    None => {
                        warn!("dispatcher stopped");
                        break;
                    }
                }
            }
        }
    }
    ctx.cancel();
    tracker.shutdown();
    dispatcher.abort();
    Ok(())
}

fn run_parse(output: Output, key: &str) -> Result<()> {
    let key: TrackedKey = key.parse()?;
    let parsed = ParsedKey {
        gvk: key.group_version_kind().clone(),
        group_kind: key.group_kind(),
        target: key.namespaced_name().clone(),
    };
    match output {
        Output::Human => {
            println!("gvk:        {}", parsed.gvk);
            println!("group-kind: {}", parsed.group_kind);
            println!("namespace:  {}", if parsed.target.namespace.is_empty() { "(cluster)" } else { parsed.target.namespace.as_str() });
            println!("name:       {}", parsed.target.name);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&parsed)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Track { pairs, ttl_secs, refresh_secs } => run_track(cli.output, pairs, ttl_secs, refresh_secs).await,
        Commands::Parse { key } => run_parse(cli.output, &key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_pairs() {
        let p: TrackPair = "cert-manager.io/v1/Certificate:prod/web-tls=prod/web".parse().unwrap();
        assert_eq!(p.key.group_kind(), GroupKind::new("cert-manager.io", "Certificate"));
        assert_eq!(p.by, NamespacedName::new("prod", "web"));
        assert!("v1/ConfigMap:prod/settings".parse::<TrackPair>().is_err());
        assert!("v1/ConfigMap=prod/web".parse::<TrackPair>().is_err());
    }

    #[test]
    fn cli_accepts_repeated_track_flags() {
        let cli = Cli::try_parse_from([
            "kindwatchctl",
            "-o",
            "json",
            "track",
            "--track",
            "v1/ConfigMap:prod/a=prod/web",
            "--track",
            "v1/Secret:prod/b=prod/web",
            "--ttl-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Track { pairs, ttl_secs, refresh_secs } => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(ttl_secs, Some(60));
                assert_eq!(refresh_secs, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
