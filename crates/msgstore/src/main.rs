use clap::{Args, Parser, Subcommand};
use msgstore::message::decode_message;
use msgstore::storage::file::common::{list_segment_files, now_millis};
use msgstore::{DefaultMessageStore, FlushDiskType, Message, MessageExt, StoreConfig, TagFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "msgstore", version, about = "Local message store operator tool")]
struct Cli {
    /// Store root directory (ignored when --config sets one)
    #[arg(long, default_value = "./store")]
    store_dir: PathBuf,

    /// JSON or YAML store configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raise store log verbosity (-v debug, -vv trace); MSGSTORE_LOG or RUST_LOG override
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append one or more messages
    Put(PutCmd),
    /// Read a queue from a logical offset
    Get(GetCmd),
    /// Look messages up by key
    Query(QueryCmd),
    /// Print store offsets, segments and runtime info
    Inspect,
    /// Run concurrent producers against the store and report throughput
    Bench(BenchCmd),
}

#[derive(Args, Debug)]
struct PutCmd {
    #[arg(long)]
    topic: String,
    #[arg(long, default_value_t = 0)]
    queue_id: u32,
    /// Message body. Repeat to send multiple messages.
    #[arg(long, required = true)]
    body: Vec<String>,
    #[arg(long)]
    tags: Option<String>,
    /// Index key (repeatable)
    #[arg(long = "key")]
    keys: Vec<String>,
}

#[derive(Args, Debug)]
struct GetCmd {
    #[arg(long)]
    topic: String,
    #[arg(long, default_value_t = 0)]
    queue_id: u32,
    #[arg(long, default_value_t = 0)]
    offset: u64,
    #[arg(long, default_value_t = 32)]
    max_messages: usize,
    /// Tag expression, e.g. "TagA || TagB"
    #[arg(long, default_value = "*")]
    tags: String,
}

#[derive(Args, Debug)]
struct QueryCmd {
    #[arg(long)]
    topic: String,
    #[arg(long)]
    key: String,
    #[arg(long, default_value_t = 32)]
    max_messages: usize,
    /// Window start, epoch millis
    #[arg(long, default_value_t = 0)]
    begin: i64,
    /// Window end, epoch millis (default: now)
    #[arg(long)]
    end: Option<i64>,
}

#[derive(Args, Debug)]
struct BenchCmd {
    #[arg(long, default_value = "bench")]
    topic: String,
    #[arg(long, default_value_t = 4)]
    producers: usize,
    #[arg(long, default_value_t = 10_000)]
    messages_per_producer: usize,
    #[arg(long, default_value_t = 256)]
    body_size: usize,
    /// Use synchronous group-commit flushing
    #[arg(long, default_value_t = false)]
    sync: bool,
}

fn load_config(cli: &Cli) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    match &cli.config {
        Some(path) => Ok(StoreConfig::from_path(path)?),
        None => Ok(StoreConfig::with_root_dir(&cli.store_dir)),
    }
}

fn open_store(config: StoreConfig) -> Result<DefaultMessageStore, Box<dyn std::error::Error>> {
    let store = DefaultMessageStore::new(config)?;
    if !store.load()? {
        return Err("store refused to load: recovery would discard too much flushed data".into());
    }
    store.start()?;
    Ok(store)
}

fn print_message(ext: &MessageExt) {
    print!(
        "[{}] queue_offset={} phy_offset={} stored={}",
        ext.msg_id, ext.queue_offset, ext.commit_log_offset, ext.store_timestamp
    );
    if let Some(tags) = ext.message.tags() {
        print!(" tags={tags}");
    }
    let keys = ext.message.keys();
    if !keys.is_empty() {
        print!(" keys={keys:?}");
    }
    println!(" body={}", String::from_utf8_lossy(&ext.message.body));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    msgstore::telemetry::init(cli.verbose);

    let mut config = load_config(&cli)?;
    match cli.command {
        Commands::Put(args) => {
            let store = open_store(config)?;
            for body in args.body {
                let mut msg = Message::new(args.topic.clone(), args.queue_id, body);
                if let Some(tags) = &args.tags {
                    msg = msg.with_tags(tags.clone());
                }
                if !args.keys.is_empty() {
                    msg = msg.with_keys(args.keys.iter().cloned());
                }
                let result = store.put_message(&msg);
                match result.append_result {
                    Some(appended) => println!(
                        "{:?} msg_id={} phy_offset={} queue_offset={}",
                        result.status, appended.msg_id, appended.wrote_offset, appended.logics_offset
                    ),
                    None => println!("{:?}", result.status),
                }
            }
            store.shutdown();
        }
        Commands::Get(args) => {
            let store = open_store(config)?;
            let filter = TagFilter::parse(&args.tags);
            let result = store.get_message(
                &args.topic,
                args.queue_id,
                args.offset,
                args.max_messages,
                Some(&filter),
            )?;
            for buffer in &result.messages {
                print_message(&decode_message(buffer.as_bytes())?);
            }
            println!(
                "status={:?} next_begin_offset={} min={} max={}",
                result.status, result.next_begin_offset, result.min_offset, result.max_offset
            );
            store.shutdown();
        }
        Commands::Query(args) => {
            let store = open_store(config)?;
            let end = args.end.unwrap_or_else(now_millis);
            let result =
                store.query_message(&args.topic, &args.key, args.max_messages, args.begin, end)?;
            for buffer in &result.messages {
                print_message(&decode_message(buffer.as_bytes())?);
            }
            println!(
                "{} messages, index last updated at {} (offset {})",
                result.messages.len(),
                result.index_last_update_timestamp,
                result.index_last_update_phy_offset
            );
            store.shutdown();
        }
        Commands::Inspect => {
            let commit_log_dir = config.commit_log_dir();
            let store = open_store(config)?;
            for (offset, path) in list_segment_files(&commit_log_dir)? {
                println!("segment {offset:>20} {}", path.display());
            }
            println!(
                "commit log range [{}, {})",
                store.get_min_phy_offset(),
                store.get_max_phy_offset()
            );
            for (name, value) in store.runtime_info() {
                println!("{name}: {value}");
            }
            store.shutdown();
        }
        Commands::Bench(args) => {
            if args.sync {
                config.flush_disk_type = FlushDiskType::sync_default();
            }
            let store = Arc::new(open_store(config)?);
            let body = vec![b'x'; args.body_size];
            let started = Instant::now();

            let handles: Vec<_> = (0..args.producers)
                .map(|producer| {
                    let store = Arc::clone(&store);
                    let topic = args.topic.clone();
                    let body = body.clone();
                    let count = args.messages_per_producer;
                    std::thread::spawn(move || {
                        let mut failed = 0usize;
                        for _ in 0..count {
                            let msg = Message::new(topic.clone(), producer as u32, body.clone());
                            if !store.put_message(&msg).is_ok() {
                                failed += 1;
                            }
                        }
                        failed
                    })
                })
                .collect();
            let mut failed = 0usize;
            for handle in handles {
                failed += handle.join().map_err(|_| "producer thread panicked")?;
            }

            let elapsed = started.elapsed().max(Duration::from_millis(1));
            let total = args.producers * args.messages_per_producer;
            let mode = if store.config().flush_disk_type.is_sync() {
                "sync"
            } else {
                "async"
            };
            println!(
                "{total} messages ({failed} failed, {mode} flush) in {:.3}s: {:.0} msg/s",
                elapsed.as_secs_f64(),
                total as f64 / elapsed.as_secs_f64()
            );
            store.shutdown();
        }
    }
    Ok(())
}
