//! Cumulus-DB CLI
//!
//! A cluster-routed vector similarity store.
//!
//! # Usage
//!
//! ```bash
//! # Throwaway in-memory benchmark: 5000 random vectors, insert + query
//! cumulus-db bench --dim 100 --count 5000
//!
//! # Durable store under ./data (requires the sqlite3 binary on PATH)
//! cumulus-db insert --dim 3 --payload "hello" --vector "1,0,0"
//! cumulus-db query --dim 3 --vector "0.9,0.1,0" -k 5
//! cumulus-db stats --dim 3
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use cumulus_db::{
    ClusterConfig, ClusterStore, DbConfig, MemoryStore, SqliteStore, StoreConfig, VectorConfig,
    DEFAULT_QUERY_LIMIT,
};

#[derive(Parser)]
#[command(name = "cumulus-db")]
#[command(about = "A cluster-routed vector similarity store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Store shape shared by every subcommand. These must match across runs
/// against the same data directory.
#[derive(Args)]
struct StoreOpts {
    /// Vector dimension
    #[arg(long)]
    dim: usize,

    /// Declared upper value bound
    #[arg(long, default_value = "1.0")]
    max: f32,

    /// Declared lower value bound
    #[arg(long, default_value = "-1.0")]
    min: f32,

    /// Cluster join / drift threshold in [0, 1]
    #[arg(long, default_value = "0.4")]
    max_distance: f32,

    /// Number of physical shards
    #[arg(long, default_value = "10")]
    partition: usize,

    /// Logical table namespace
    #[arg(long, default_value = "test")]
    table: String,

    /// Data directory for the sqlite backend
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert-and-query a batch of random vectors against an in-memory
    /// store, reporting timings
    Bench {
        #[command(flatten)]
        store: StoreOpts,

        /// Number of random vectors
        #[arg(long, default_value = "5000")]
        count: usize,

        /// Query only, skipping inserts
        #[arg(long)]
        query_only: bool,
    },

    /// Insert a payload under a vector
    Insert {
        #[command(flatten)]
        store: StoreOpts,

        /// Opaque payload stored with the vector
        #[arg(short, long)]
        payload: String,

        /// Vector (comma separated floats)
        #[arg(short, long, value_delimiter = ',')]
        vector: Vec<f32>,
    },

    /// Query the nearest neighbors of a vector
    Query {
        #[command(flatten)]
        store: StoreOpts,

        /// Query vector (comma separated floats)
        #[arg(short, long, value_delimiter = ',')]
        vector: Vec<f32>,

        /// Number of results
        #[arg(short = 'k', long, default_value_t = DEFAULT_QUERY_LIMIT)]
        k: usize,
    },

    /// Display cluster and shard statistics
    Stats {
        #[command(flatten)]
        store: StoreOpts,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            store,
            count,
            query_only,
        } => {
            let config = store_config(&store);
            let store = ClusterStore::open(config, MemoryStore::factory())?;
            run_bench(&store, count, query_only)?;
        }

        Commands::Insert {
            store,
            payload,
            vector,
        } => {
            let store = open_sqlite(&store)?;
            let vector = store.make_vector(vector)?;
            let cluster_id = store.insert(&payload, &vector)?;
            // Let the rebalance drain before the process exits.
            store.wait_settled(Duration::from_secs(30));
            println!("inserted into cluster {cluster_id}");
        }

        Commands::Query { store, vector, k } => {
            let store = open_sqlite(&store)?;
            let vector = store.make_vector(vector)?;
            let start = Instant::now();
            let results = store.query(&vector, k)?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            println!("Query time: {elapsed_ms:.2}ms");
            if results.is_empty() {
                println!("No results.");
            }
            for result in results {
                println!(
                    "  payload: {}, distance: {:.4}",
                    result.payload, result.distance
                );
            }
        }

        Commands::Stats { store } => {
            let store = open_sqlite(&store)?;
            let stats = store.stats()?;
            println!("Clusters: {}", stats.clusters);
            println!("Partitions: {}", stats.partitions);
            println!("Pending maintenance: {}", stats.pending_maintenance);
        }
    }

    Ok(())
}

fn store_config(opts: &StoreOpts) -> StoreConfig {
    StoreConfig {
        vector: VectorConfig {
            size: opts.dim,
            max: opts.max,
            min: opts.min,
        },
        cluster: ClusterConfig {
            max_distance: opts.max_distance,
            partition: opts.partition,
        },
        db: DbConfig {
            table: opts.table.clone(),
        },
    }
}

fn open_sqlite(opts: &StoreOpts) -> anyhow::Result<ClusterStore> {
    let factory = SqliteStore::factory(&opts.data_dir, &opts.table);
    Ok(ClusterStore::open(store_config(opts), factory)?)
}

fn run_bench(store: &ClusterStore, count: usize, query_only: bool) -> anyhow::Result<()> {
    let dim = store.config().vector.size;
    let (max, min) = (store.config().vector.max, store.config().vector.min);
    let mut rng = rand::thread_rng();
    let progress_interval = (count / 10).max(1);

    let mut insert_total = Duration::ZERO;
    let mut query_total = Duration::ZERO;

    for i in 0..count {
        let values: Vec<f32> = (0..dim).map(|_| rng.gen_range(min..max)).collect();
        let vector = store.make_vector(values)?;

        if !query_only {
            let start = Instant::now();
            store.insert(&format!("data_{i}"), &vector)?;
            insert_total += start.elapsed();
        }

        let start = Instant::now();
        let results = store.query(&vector, DEFAULT_QUERY_LIMIT)?;
        query_total += start.elapsed();

        if (i + 1) % progress_interval == 0 {
            tracing::info!(
                "{}/{} done, last query returned {} results",
                i + 1,
                count,
                results.len()
            );
        }
    }

    let settled = store.wait_settled(Duration::from_secs(60));
    if !settled {
        tracing::warn!("maintenance backlog did not drain within 60s");
    }

    let stats = store.stats()?;
    tracing::info!(
        "bench complete: {} vectors, {} clusters over {} partitions",
        count,
        stats.clusters,
        stats.partitions
    );
    if !query_only {
        tracing::info!(
            "insert avg: {:.3}ms",
            insert_total.as_secs_f64() * 1000.0 / count as f64
        );
    }
    tracing::info!(
        "query avg: {:.3}ms",
        query_total.as_secs_f64() * 1000.0 / count as f64
    );

    Ok(())
}
