//! entitycache command line
//!
//! Runs the notes workload, a concurrent stress workload, or prints the
//! effective configuration.

use anyhow::{bail, Context};
use entitycache::database::MemoryDatabase;
use entitycache::{CacheConfig, EntityKey, Gateway, GatewayStats, NoteService};
use rand::Rng;
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keys touched by the stress workload
const STRESS_KEY_SPACE: i64 = 1_000;

fn main() {
    if let Err(e) = run() {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("--help") | Some("-h") => print_help(),
        Some("--version") | Some("-v") => println!("entitycache v{}", VERSION),
        Some("demo") => {
            init_logging();
            let config = load_config(args.get(2))?;
            demo(config)?;
        }
        Some("stress") => {
            init_logging();
            let threads = parse_arg(args.get(2), "threads", 4)?;
            let ops = parse_arg(args.get(3), "ops", 10_000)?;
            let config = load_config(args.get(4))?;
            stress(config, threads, ops)?;
        }
        Some("config") => {
            let config = load_config(args.get(2))?;
            println!("{}", config.to_json_pretty()?);
        }
        Some(other) => {
            print_help();
            bail!("unknown command '{}'", other);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"
entitycache v{} - read-through / write-through entity cache

Usage:
  entitycache-cli demo [config.json]                     Run the notes workload
  entitycache-cli stress [threads] [ops] [config.json]   Concurrent mixed workload
  entitycache-cli config [config.json]                   Print the effective config
  entitycache-cli --version                              Show version

Logging is controlled by RUST_LOG (default: info).
"#,
        VERSION
    );
}

fn load_config(path: Option<&String>) -> anyhow::Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path)),
        None => Ok(CacheConfig::default()),
    }
}

fn parse_arg(arg: Option<&String>, name: &str, default: usize) -> anyhow::Result<usize> {
    match arg {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid {} '{}'", name, value)),
        None => Ok(default),
    }
}

fn demo(config: CacheConfig) -> anyhow::Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let gateway = Arc::new(Gateway::new(db.clone(), config)?);
    let notes = NoteService::new(Arc::clone(&gateway))?;

    println!("📝 Creating notes...");
    for (title, content) in [
        ("groceries", "milk, eggs, bread"),
        ("todo", "write the quarterly report"),
        ("ideas", "cache all the things"),
    ] {
        let note = notes.create(title, content)?;
        println!("   #{} {}", note.id, note.title);
    }

    println!("\n🔍 Reading (served from cache after write-through)...");
    let loads = db.stats().loads;
    if let Some(note) = notes.get(1)? {
        println!("   #{} {}: {}", note.id, note.title, note.content);
    }
    println!("   database loads: {}", db.stats().loads - loads);

    println!("\n🔎 Searching by title 'todo' (twice)...");
    for _ in 0..2 {
        let found = notes.find_by_title("todo")?;
        println!("   {:?}", found.map(|note| note.id));
    }

    println!("\n✏️  Updating #2 and archiving #3...");
    notes.update(2, "todo", "write the quarterly report by Friday", false)?;
    notes.archive(3)?;

    println!("\n📋 Active notes:");
    for note in notes.list_active()? {
        println!("   #{} {}: {}", note.id, note.title, note.content);
    }

    println!("\n🗑️  Deleting #1...");
    notes.delete(1)?;
    println!("   #1 -> {:?}", notes.get(1)?);
    println!("   all notes: {}", notes.find_all()?.len());

    print_stats(&gateway.stats());
    Ok(())
}

fn stress(config: CacheConfig, threads: usize, ops: usize) -> anyhow::Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let gateway = Arc::new(Gateway::new(db.clone(), config)?);

    info!(threads, ops, "starting stress workload");
    let started = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || -> entitycache::Result<()> {
                let mut rng = rand::thread_rng();
                for _ in 0..ops {
                    let key = EntityKey::new("Counter", rng.gen_range(0..STRESS_KEY_SPACE));
                    if rng.gen_bool(0.2) {
                        gateway.write(&key, |current: Option<u64>| Ok(current.unwrap_or(0) + 1))?;
                    } else {
                        gateway.get::<u64>(&key)?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("stress worker panicked"),
        }
    }

    let elapsed = started.elapsed();
    gateway.tick();

    // Every cached entry must match the committed version
    let mut incoherent = 0;
    for id in 0..STRESS_KEY_SPACE {
        let key = EntityKey::new("Counter", id);
        if let Some(entry) = gateway.store().peek(&key) {
            if entry.version != db.version_of(&key) {
                incoherent += 1;
            }
        }
    }

    let total = threads * ops;
    println!("🚀 {} ops on {} threads in {:?}", total, threads, elapsed);
    println!(
        "   throughput: {:.0} ops/sec",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    print_stats(&gateway.stats());

    if incoherent > 0 {
        bail!("{} cached entries disagree with the database", incoherent);
    }
    println!("✅ cache coherent with database");
    Ok(())
}

fn print_stats(stats: &GatewayStats) {
    println!("\n📊 Stats");
    println!(
        "   cache:     {} entries / {} capacity, hit rate {:.1}%",
        stats.cache.size,
        stats.cache.capacity,
        stats.cache.hit_rate() * 100.0
    );
    println!(
        "              hits {}, misses {}, puts {}, stale rejected {}",
        stats.cache.hits, stats.cache.misses, stats.cache.puts, stats.cache.stale_rejected
    );
    println!(
        "              evictions {}, expirations {}, invalidations {}",
        stats.cache.evictions, stats.cache.expirations, stats.cache.invalidations
    );
    println!(
        "   queries:   hits {}, misses {}, stale {}",
        stats.queries.hits, stats.queries.misses, stats.queries.stale
    );
    println!(
        "   coherence: seq {}, delivered {}, retries {}, violations {}",
        stats.coherence.sequence,
        stats.coherence.messages_delivered,
        stats.coherence.retries,
        stats.coherence.violations
    );
    println!(
        "   gateway:   loads {}, writes {} ({} failed), bypassed reads {}, locked-slot misses {}",
        stats.loads, stats.writes, stats.failed_writes, stats.bypassed_reads, stats.locked_slot_misses
    );
}
