use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kgraph_api::{AllowAll, GraphApi, InProcApi};
use kgraph_core::config::IngestConfig;
use kgraph_entity::Normalizer;
use kgraph_kubehub::{ClusterLocator, Fetcher, KubeLister};
use kgraph_store::{spawn_ingest, Backoff, CatalogSink, CycleReport, JsonLinesSink, MemorySink, Pipeline, Scheduler};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kgraphctl", version, about = "Kubernetes custom resource graph ingestion")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Ingestion config (YAML)
    #[arg(short = 'c', long = "config", env = "KGRAPH_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted; deltas go to stdout as JSON lines
    Run,
    /// Run one cycle for every cluster and print the results
    Once {
        /// Print the emitted deltas as JSON lines instead of a summary
        #[arg(long = "deltas", action = ArgAction::SetTrue)]
        deltas: bool,
    },
    /// Resolve configured and discovered clusters
    Clusters,
    /// List kinds served by a cluster
    Discover {
        /// Cluster name as configured
        cluster: String,
    },
    /// Ingest once and print the graph rooted at an entity id
    Graph {
        /// Entity id, e.g. "prod/xbucket/team-a/logs"
        root: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KGRAPH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries deltas and command output
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KGRAPH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KGRAPH_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig> {
    let mut cfg = match path {
        Some(p) => IngestConfig::load(p)?,
        None => {
            warn!("no config given; using defaults (no static clusters)");
            IngestConfig::default()
        }
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

fn build_scheduler(cfg: &IngestConfig, sink: Arc<dyn CatalogSink>) -> Scheduler {
    let (kinds, errs) = cfg.effective_kinds();
    for e in &errs {
        warn!(error = %e, "config: kind selector skipped");
    }
    let normalizer = Normalizer::new(&cfg.annotation_prefix).with_selectors(&kinds);
    let fetcher = Fetcher::new(Arc::new(KubeLister::new()), cfg.fetch.clone());
    let pipeline = Pipeline::new(fetcher, kinds, normalizer, sink, Default::default());
    Scheduler::new(ClusterLocator::new(cfg.clusters.clone()), pipeline, cfg.interval(), Backoff::from_config(&cfg.backoff))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterRow<'a> {
    name: &'a str,
    api_base_url: &'a str,
}

fn print_reports(reports: &[CycleReport], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for r in reports {
                println!(
                    "{} • {} entities • +{} ~{} -{} • {} errors",
                    r.result.cluster.name,
                    r.result.entities.len(),
                    r.delta.added.len(),
                    r.delta.updated.len(),
                    r.delta.removed.len(),
                    r.result.errors.len()
                );
                for e in &r.result.errors {
                    println!("  {:?} {:?}: {}", e.class, e.scope, e.cause);
                }
            }
        }
        Output::Json => {
            let results: Vec<_> = reports.iter().map(|r| &r.result).collect();
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down");
                    on_signal.cancel();
                }
            });
            let sink: Arc<dyn CatalogSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));
            let handle = spawn_ingest(build_scheduler(&cfg, sink), cancel);
            handle.join().await;
        }
        Commands::Once { deltas } => {
            let t0 = Instant::now();
            let sink: Arc<dyn CatalogSink> =
                if deltas { Arc::new(JsonLinesSink::new(std::io::stdout())) } else { Arc::new(MemorySink::new()) };
            let scheduler = build_scheduler(&cfg, sink);
            let reports = scheduler.run_once(&CancellationToken::new()).await?;
            info!(clusters = reports.len(), took_ms = %t0.elapsed().as_millis(), "once: done");
            if !deltas {
                print_reports(&reports, cli.output)?;
            }
        }
        Commands::Clusters => {
            let resolution = ClusterLocator::new(cfg.clusters.clone()).resolve_clusters().await?;
            match cli.output {
                Output::Human => {
                    for c in &resolution.clusters {
                        println!("{} • {}", c.name, c.api_base_url);
                    }
                    for e in &resolution.errors {
                        println!("skipped: {}", e);
                    }
                }
                Output::Json => {
                    let rows: Vec<ClusterRow> = resolution
                        .clusters
                        .iter()
                        .map(|c| ClusterRow { name: &c.name, api_base_url: &c.api_base_url })
                        .collect();
                    let skipped: Vec<String> = resolution.errors.iter().map(|e| e.to_string()).collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "clusters": rows, "skipped": skipped }))?);
                }
            }
        }
        Commands::Discover { cluster } => {
            let resolution = ClusterLocator::new(cfg.clusters.clone()).resolve_clusters().await?;
            let target = resolution
                .clusters
                .iter()
                .find(|c| c.name == cluster)
                .ok_or_else(|| anyhow!("cluster {:?} is not configured or failed to resolve", cluster))?;
            let (kinds, _) = cfg.effective_kinds();
            // Discovered kinds carry no namespace filter.
            let configured: Vec<String> =
                kinds.into_iter().map(|mut k| { k.namespace = None; k.key() }).collect();
            let resources = KubeLister::new()
                .discover_kinds(target)
                .await
                .with_context(|| format!("discovering kinds on {}", cluster))?;
            match cli.output {
                Output::Human => {
                    for r in &resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let mark = if configured.contains(&r.gvk_key()) { " • configured" } else { "" };
                        println!("{} • {}{}", r.gvk_key(), scope, mark);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Graph { root } => {
            let scheduler = build_scheduler(&cfg, Arc::new(MemorySink::new()));
            scheduler.run_once(&CancellationToken::new()).await?;
            let api = InProcApi::new(scheduler.index());
            let graph = api.get_graph(&root, &AllowAll).await?;
            match cli.output {
                Output::Human => {
                    println!("{} ({} nodes, cycle {})", graph.root, graph.nodes.len(), graph.cycle_id);
                    for n in &graph.nodes {
                        println!("  {:?} {}", n.kind, n.id);
                    }
                    for e in &graph.edges {
                        println!("  {} -[{:?}]-> {}", e.from, e.relation_type, e.to);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&graph)?),
            }
        }
    }
    Ok(())
}
