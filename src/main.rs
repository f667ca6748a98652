//! FlashSync - Redis Replication Ingestion
//!
//! This is the main entry point. It loads the configuration, starts one
//! reader per source, and feeds their entries through the pipeline into
//! the target.

use anyhow::{bail, Context};
use flashsync::config::Config;
use flashsync::connection::discover_masters;
use flashsync::entry::Entry;
use flashsync::pipeline::{KeyPrefixRename, Pipeline};
use flashsync::replication::{replay_rdb_file, ReplicationSession};
use flashsync::status::{Status, StatusReporter};
use flashsync::writer::Dispatcher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command-line options, applied on top of the config file.
#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    source: Option<String>,
    target: Option<String>,
    rdb: Option<PathBuf>,
    log_level: Option<String>,
}

impl Args {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut args = Args::default();
        let argv: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < argv.len() {
            let flag = argv[i].as_str();
            match flag {
                "--config" | "-c" | "--source" | "-s" | "--target" | "-t" | "--rdb"
                | "--log-level" => {
                    let Some(value) = argv.get(i + 1).cloned() else {
                        eprintln!("Error: {} requires a value", flag);
                        std::process::exit(1);
                    };
                    match flag {
                        "--config" | "-c" => args.config = Some(PathBuf::from(value)),
                        "--source" | "-s" => args.source = Some(value),
                        "--target" | "-t" => args.target = Some(value),
                        "--rdb" => args.rdb = Some(PathBuf::from(value)),
                        _ => args.log_level = Some(value),
                    }
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashSync version {}", flashsync::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", argv[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        args
    }

    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(source) = self.source {
            config.source.address = source;
        }
        if let Some(target) = self.target {
            config.target.address = target;
        }
        if let Some(rdb) = self.rdb {
            config.source.rdb_file = Some(rdb);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_help() {
    println!(
        r#"
FlashSync - Redis Replication Ingestion

USAGE:
    flashsync [OPTIONS]

OPTIONS:
    -c, --config <FILE>       TOML configuration file
    -s, --source <ADDR>       Source master (default: 127.0.0.1:6379)
    -t, --target <ADDR>       Target server (default: 127.0.0.1:6380)
        --rdb <FILE>          Replay an RDB file instead of replicating
        --log-level <LEVEL>   error, warn, info, debug or trace (RUST_LOG wins)
    -v, --version             Print version information
    -h, --help                Print this help message

EXAMPLES:
    flashsync -s 10.0.0.1:6379 -t 10.0.0.2:6379
    flashsync --rdb dump.rdb -t 127.0.0.1:7000
    flashsync -c flashsync.toml
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::from_args().into_config()?;

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(version = flashsync::VERSION, "FlashSync starting");

    let status = Arc::new(Status::new());
    let _reporter = StatusReporter::start(
        Arc::clone(&status),
        Duration::from_secs(config.advanced.status_interval_secs.max(1)),
    );

    let writer_config = config.writer_config();
    let mut dispatcher = Dispatcher::connect(&writer_config, &status)
        .await
        .with_context(|| format!("connecting to target {}", writer_config.address))?;

    let (tx, mut rx) = mpsc::channel(config.advanced.entry_channel_capacity);
    let mut readers = start_readers(&config, &status, tx).await?;

    let mut pipeline = Pipeline::new(config.filter.clone(), Arc::clone(&status.entries));
    if let Some(rename) = KeyPrefixRename::from_config(&config.transform) {
        pipeline = pipeline.with_transform(Box::new(rename));
    }

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                dispatch(&mut pipeline, &mut dispatcher, entry).await?;
            }
            Some(joined) = readers.join_next() => {
                joined.context("reader task panicked")??;
            }
            _ = &mut shutdown => {
                warn!("Shutdown signal received, stopping");
                readers.abort_all();
                return Ok(());
            }
        }
    }

    // Every sender is gone, so every reader has returned.
    while let Some(joined) = readers.join_next().await {
        joined.context("reader task panicked")??;
    }
    dispatcher.close().await.context("draining target replies")?;

    let total = status.entries.total();
    info!(
        allowed = total.allow,
        filtered = total.disallow,
        elapsed_secs = status.uptime().as_secs(),
        "FlashSync finished"
    );
    Ok(())
}

async fn dispatch(
    pipeline: &mut Pipeline,
    dispatcher: &mut Dispatcher,
    entry: Entry,
) -> anyhow::Result<()> {
    for entry in pipeline.process(entry) {
        let id = entry.id;
        if let Err(e) = dispatcher.write(entry).await {
            error!(id, error = %e, "write failed");
            return Err(e.into());
        }
    }
    Ok(())
}

/// Spawns the file replay or one replication session per source master.
async fn start_readers(
    config: &Config,
    status: &Arc<Status>,
    tx: mpsc::Sender<Entry>,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let mut readers = JoinSet::new();

    if let Some(path) = config.source.rdb_file.clone() {
        let loader = config.loader_config(&path.display().to_string());
        let reader = status.register_reader(format!("reader_{}", path.display()));
        readers.spawn(async move {
            let summary = replay_rdb_file(&path, loader, reader, tx)
                .await
                .with_context(|| format!("replaying {}", path.display()))?;
            info!(keys = summary.keys, entries = summary.entries, "RDB file replayed");
            Ok(())
        });
        return Ok(readers);
    }

    let masters = if config.source.cluster {
        let nodes = discover_masters(
            &config.source.address,
            &config.source_credentials(),
            &config.source_tls(),
        )
        .await
        .with_context(|| format!("discovering source cluster {}", config.source.address))?;
        nodes.into_iter().map(|n| n.address).collect()
    } else {
        vec![config.source.address.clone()]
    };
    if masters.is_empty() {
        bail!("source {} has no masters", config.source.address);
    }

    for address in masters {
        let session_config = config.session_config(&address);
        let reader = status.register_reader(session_config.name.clone());
        let session = ReplicationSession::new(session_config, reader);
        let tx = tx.clone();
        readers.spawn(async move {
            session
                .run(tx)
                .await
                .with_context(|| format!("replicating from {}", address))
        });
    }
    Ok(readers)
}
