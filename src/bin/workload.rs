//! AtlasRS Workload Binary
//!
//! Drives inserts into an ordinary, capped or log record store on the
//! in-memory engine and prints the resulting stats as JSON.

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use atlasrs::{
    retry_on_write_conflict, CollectionOptions, Config, Engine, LogTimestamp, RecordStore,
    ValidateLevel,
};
use atlasrs::store::AcceptAll;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    /// Unbounded collection
    Ordinary,
    /// Capped collection bounded by deletion
    Capped,
    /// Replication log bounded by markers
    Log,
}

/// AtlasRS Workload
#[derive(Parser, Debug)]
#[command(name = "atlasrs-workload")]
#[command(about = "Insert workload against an AtlasRS record store")]
#[command(version)]
struct Args {
    /// Collection kind
    #[arg(short, long, value_enum, default_value = "capped")]
    kind: Kind,

    /// Number of batches to insert
    #[arg(short, long, default_value = "1000")]
    batches: usize,

    /// Records per batch
    #[arg(long, default_value = "10")]
    batch_size: usize,

    /// Payload size per record in bytes
    #[arg(short, long, default_value = "256")]
    record_bytes: usize,

    /// Capped / log max size in KB
    #[arg(short, long, default_value = "1024")]
    max_size_kb: i64,

    /// Optional document cap for capped collections
    #[arg(long)]
    max_docs: Option<i64>,

    /// Validate the store after the workload
    #[arg(long)]
    validate: bool,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasrs=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("AtlasRS Workload v{}", atlasrs::VERSION);

    if let Err(e) = run(&args) {
        tracing::error!("Workload failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> atlasrs::Result<()> {
    let engine = Engine::open_in_memory(Config::default())?;
    let max_size = args.max_size_kb * 1024;

    let options = match args.kind {
        Kind::Ordinary => CollectionOptions::builder("workload.ordinary").build(),
        Kind::Capped => {
            let builder = CollectionOptions::builder("workload.capped").capped(max_size);
            match args.max_docs {
                Some(docs) => builder.max_docs(docs).build(),
                None => builder.build(),
            }
        }
        Kind::Log => CollectionOptions::builder("local.oplog.rs")
            .capped(max_size)
            .log()
            .build(),
    };
    let store = engine.create_record_store(&options)?;

    let body = vec![b'x'; args.record_bytes];
    let mut next_inc: u32 = 1;
    for _ in 0..args.batches {
        let batch = make_batch(&store, &body, args.batch_size, &mut next_inc);
        retry_on_write_conflict("insert", || {
            let mut ru = engine.recovery_unit();
            store.insert(&mut ru, &batch, &[])?;
            ru.commit()
        })?;
    }

    if store.is_log() {
        let reclaimed = store.reclaim_log()?;
        tracing::info!("Reclaimed {} log markers", reclaimed);
    }

    if args.validate {
        let mut ru = engine.recovery_unit();
        let results = store.validate(&mut ru, ValidateLevel::Full, &AcceptAll)?;
        println!(
            "{}",
            serde_json::to_string_pretty(&results).unwrap_or_default()
        );
    }

    let stats = store.append_stats(1);
    println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());

    engine.close()
}

fn make_batch(store: &RecordStore, body: &[u8], size: usize, next_inc: &mut u32) -> Vec<Bytes> {
    (0..size)
        .map(|_| {
            if store.is_log() {
                let ts = LogTimestamp::new(1, *next_inc);
                *next_inc += 1;
                Bytes::from(ts.encode_entry(body))
            } else {
                Bytes::copy_from_slice(body)
            }
        })
        .collect()
}
