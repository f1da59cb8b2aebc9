//! edgesync CLI
//!
//! # Usage
//!
//! ```bash
//! # Run an edge node syncing against an indexing server
//! edgesync serve --data-dir ./edge --indexer http://indexer:8080 --embedder http://localhost:9000
//!
//! # Query a running node
//! edgesync search --server http://localhost:8088 --text "red car at the gate"
//!
//! # Offline inspection
//! edgesync queue-stats --data-dir ./edge
//! edgesync inspect-snapshot --file ./edge/immutable/snap_00000000000000000003.snap
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use edgesync::model::{ApiResponse, SearchRequest, SearchResponseBody};
use edgesync::queue::{DurableQueue, QueueOptions};
use edgesync::{
    EdgeConfig, EdgeEngine, EmbeddingProvider, HttpEmbeddingProvider, HttpIndexingServer,
    DEFAULT_DIM,
};
use edgesync_core::{sha256_hex, SnapshotView};

#[derive(Parser)]
#[command(name = "edgesync")]
#[command(about = "Edge-side vector store with snapshot sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the edge node: HTTP API plus background sync
    Serve {
        #[arg(long, env = "EDGESYNC_DATA_DIR", default_value = "edge-data")]
        data_dir: PathBuf,

        /// Embedding dimensionality
        #[arg(long, env = "EDGESYNC_DIM", default_value_t = DEFAULT_DIM)]
        dim: usize,

        #[arg(long, env = "EDGESYNC_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, env = "EDGESYNC_PORT", default_value = "8088")]
        port: u16,

        /// Indexing server base URL; sync is disabled without it
        #[arg(long, env = "EDGESYNC_INDEXER_URL")]
        indexer: Option<String>,

        #[arg(long, env = "EDGESYNC_INDEXER_API_KEY")]
        indexer_api_key: Option<String>,

        /// Embedding model server base URL; enables image intake and text search
        #[arg(long, env = "EDGESYNC_EMBEDDER_URL")]
        embedder: Option<String>,

        /// Cosine similarity at which consecutive frames count as duplicates
        #[arg(long, env = "EDGESYNC_DEDUP_THRESHOLD")]
        dedup_threshold: Option<f32>,

        #[arg(long, env = "EDGESYNC_SYNC_INTERVAL_SECS")]
        sync_interval_secs: Option<u64>,

        /// Queue depth that triggers an early sync
        #[arg(long, env = "EDGESYNC_UPLOAD_THRESHOLD")]
        upload_threshold: Option<usize>,

        #[arg(long, env = "EDGESYNC_UPLOAD_BATCH")]
        upload_batch: Option<usize>,

        #[arg(long, env = "EDGESYNC_MMR_LAMBDA")]
        mmr_lambda: Option<f32>,
    },

    /// Search a running node
    Search {
        #[arg(long, default_value = "http://localhost:8088")]
        server: String,

        /// Query vector (comma separated floats)
        #[arg(short, long, conflicts_with = "text")]
        query: Option<String>,

        /// Free-text query, embedded by the node
        #[arg(short, long)]
        text: Option<String>,

        #[arg(short = 'k', long, default_value = "3")]
        k: usize,
    },

    /// Print queue counters from a data dir (node must be stopped)
    QueueStats {
        #[arg(long, env = "EDGESYNC_DATA_DIR", default_value = "edge-data")]
        data_dir: PathBuf,
    },

    /// Validate a snapshot file and print its header
    InspectSnapshot {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            data_dir,
            dim,
            host,
            port,
            indexer,
            indexer_api_key,
            embedder,
            dedup_threshold,
            sync_interval_secs,
            upload_threshold,
            upload_batch,
            mmr_lambda,
        } => {
            let mut config = EdgeConfig::from_data_dir(data_dir, dim);
            if let Some(v) = dedup_threshold {
                config.dedup_threshold = v;
            }
            if let Some(v) = sync_interval_secs {
                config.sync_interval = Duration::from_secs(v.max(1));
            }
            if let Some(v) = upload_threshold {
                config.upload_threshold = v;
            }
            if let Some(v) = upload_batch {
                config.upload_batch_size = v;
            }
            if let Some(v) = mmr_lambda {
                config.mmr_lambda = v;
            }

            let provider: Option<Arc<dyn EmbeddingProvider>> = match embedder {
                Some(url) => Some(Arc::new(
                    HttpEmbeddingProvider::new(&url, dim, Duration::from_secs(30))
                        .context("creating embedding client")?,
                )),
                None => None,
            };
            let max_snapshot_bytes = config.max_snapshot_bytes;
            let engine = Arc::new(
                tokio::task::spawn_blocking(move || EdgeEngine::open(config, provider))
                    .await
                    .context("engine open task")?
                    .context("opening edge engine")?,
            );

            match indexer {
                Some(url) => {
                    let server = HttpIndexingServer::new(&url, indexer_api_key, max_snapshot_bytes)
                        .context("creating indexing client")?;
                    engine.start_sync(Arc::new(server));
                }
                None => tracing::warn!("no --indexer given; running without sync"),
            }

            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", host, port))?;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {}", addr))?;
            tracing::info!("edgesync listening on {}", addr);

            axum::serve(listener, edgesync::api::create_router(engine.clone()))
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutdown requested");
                })
                .await?;
            engine.shutdown().await;
        }

        Commands::Search { server, query, text, k } => {
            if query.is_none() && text.is_none() {
                return Err(anyhow!("one of --query or --text is required"));
            }
            let query = query
                .map(|q| parse_vector(&q))
                .transpose()
                .map_err(|e| anyhow!("invalid --query: {e}"))?;
            let client = reqwest::Client::new();
            let url = format!("{}/v1/search", server.trim_end_matches('/'));
            let request = SearchRequest {
                vector: query,
                text,
                k: Some(k),
            };

            let response = client.post(&url).json(&request).send().await?;
            if !response.status().is_success() {
                let error: serde_json::Value = response.json().await?;
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }

            let result: ApiResponse<SearchResponseBody> = response.json().await?;
            let result = result.data;
            println!(
                "Query time: {:.2}ms (snapshot {:?}{})",
                result.query_time_ms,
                result.snapshot_version,
                if result.degraded { ", degraded" } else { "" }
            );
            for hit in result.hits {
                println!(
                    "  {}  score {:.4}  {:?}  {}",
                    hit.id, hit.score, hit.source, hit.payload
                );
            }
        }

        Commands::QueueStats { data_dir } => {
            let config = EdgeConfig::from_data_dir(data_dir, DEFAULT_DIM);
            let queue = DurableQueue::open(QueueOptions::from_config(&config))
                .context("opening queue")?;
            println!("{}", serde_json::to_string_pretty(&queue.stats())?);
            println!("{}", serde_json::to_string_pretty(queue.recovery())?);
        }

        Commands::InspectSnapshot { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {:?}", file))?;
            let view = SnapshotView::parse(&bytes).with_context(|| format!("validating {:?}", file))?;
            let header = view.header();
            println!("Snapshot: {:?}", file);
            println!("  version:   {}", header.snapshot_version);
            if let Some(base) = header.base() {
                println!("  delta on:  {}", base);
            }
            println!("  records:   {}", view.len());
            println!("  dim:       {}", view.dim());
            println!("  sha256:    {}", sha256_hex(&bytes));
            match view.graph() {
                Some(graph) => {
                    let stats = graph.stats();
                    println!(
                        "  graph:     {} nodes, {} layers, {} edges, M={}",
                        stats.num_nodes,
                        stats.max_layer + 1,
                        stats.total_edges,
                        stats.m
                    );
                }
                None => println!("  graph:     none"),
            }
        }
    }

    Ok(())
}

fn parse_vector(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|x| x.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect()
}
