//! Demo application simulating likes on a set of posts.
//!
//! Writers increment the `likes` counter of random posts from several
//! threads, then a rollup pass folds the shards into the posts.
//!
//! Run with:
//! ```bash
//! cargo run --example likes --features demo -- --help
//! ```

use clap::Parser;
use contatori_distribuiti::cancel::CancellationToken;
use contatori_distribuiti::clock::ManualClock;
use contatori_distribuiti::counter::ShardedCounter;
use contatori_distribuiti::definition::{CounterConfig, CounterDefinition};
use contatori_distribuiti::error::Result;
use contatori_distribuiti::store::memory::MemoryStore;
use contatori_distribuiti::store::{DocumentRef, DocumentStore};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Level;

/// Demo application for contatori-distribuiti - sharded document counters.
///
/// This demo creates posts in an in-memory store, simulates concurrent likes
/// and rolls the shards up into the posts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of posts
    #[arg(short, long, default_value = "5")]
    posts: usize,

    /// Shards per post
    #[arg(short, long, default_value = "10")]
    shards: usize,

    /// Rollup interval in seconds
    #[arg(short, long, default_value = "60")]
    interval: u64,

    /// Number of writer threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Likes sent by each thread
    #[arg(long, default_value = "1000")]
    iterations: usize,

    /// Load the counter definition from a JSON file instead
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Print the rollup report as JSON
    #[arg(long)]
    json: bool,

    /// Log shard creation and rollup batches
    #[arg(short, long)]
    verbose: bool,
}

fn definition(args: &Args) -> std::result::Result<CounterDefinition, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        let config: CounterConfig = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        return Ok(CounterDefinition::try_from(config)?);
    }
    Ok(CounterDefinition::builder("likes")
        .shard_count(args.shards)
        .rollup_interval(Duration::from_secs(args.interval))
        .template(&json!({"count": 0}))
        .build()?)
}

/// Sends likes to random posts from several threads.
fn simulate_likes<C, R>(
    counter: &Arc<ShardedCounter<Arc<MemoryStore>, C, R>>,
    posts: &[DocumentRef],
    num_threads: usize,
    iterations: usize,
) -> Result<()>
where
    C: contatori_distribuiti::clock::Clock + Send + Sync + 'static,
    R: contatori_distribuiti::counter::selector::ShardSelector + Send + Sync + 'static,
{
    let mut handles = vec![];

    for _ in 0..num_threads {
        let counter = Arc::clone(counter);
        let posts = posts.to_vec();
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = rand::thread_rng();
            for _ in 0..iterations {
                let post = &posts[rng.gen_range(0..posts.len())];
                counter.increment(post, "count", 1)?;
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }
    Ok(())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    let definition = definition(&args)?;
    let interval = definition.rollup_interval();
    let store = Arc::new(MemoryStore::new());
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let clock = Arc::new(ManualClock::new(now));
    let counter = Arc::new(
        ShardedCounter::new(definition, Arc::clone(&store)).with_clock(Arc::clone(&clock)),
    );

    let posts = (0..args.posts.max(1))
        .map(|i| DocumentRef::new("posts", &format!("post-{i}")))
        .collect::<Vec<_>>();
    let cancel = CancellationToken::new();
    for post in &posts {
        store.set(
            post,
            json!({"count": 0}).as_object().cloned().unwrap_or_default(),
            &cancel,
        )?;
    }

    simulate_likes(&counter, &posts, args.threads, args.iterations)?;
    println!(
        "{} likes spread over {} shard documents",
        args.threads * args.iterations,
        store.len() - posts.len()
    );

    // Shards written now become eligible one interval later.
    clock.advance(interval);
    let report = counter.rollup()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "rollup: {} pages, {} posts, {} shards deleted",
            report.pages, report.parents, report.shards_deleted
        );
    }

    for post in &posts {
        let count = store
            .get(post, &cancel)?
            .and_then(|doc| doc.get("count").cloned())
            .unwrap_or_default();
        println!("{post}: {count}");
    }

    Ok(())
}
