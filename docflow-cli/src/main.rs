//! Runs docflow extraction pipelines from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docflow::llm::ChatClient;
use docflow::mapping::{ChatMappingGenerator, SqliteMappingCache};
use docflow::prelude::*;
use docflow::profile::ProfileDocument;
use docflow::stages::{ChatTextExtractor, KeyValueTextExtractor, TextExtractor};
use docflow::task::TaskEvent;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{info, warn};

const CACHE_FILE: &str = "mapping_cache.db";

#[derive(Parser)]
#[command(name = "docflow")]
#[command(version, about = "Extract structured records from mail and spreadsheet documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the standard pipeline over a working directory
    Run {
        /// Working directory holding source/, processing/, destination/ and error/
        #[arg(short, long, value_name = "DIR")]
        work_dir: Option<PathBuf>,

        /// Engine configuration file (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Profile document (JSON) used as the active profile
        #[arg(short, long, value_name = "FILE")]
        profile: Option<PathBuf>,

        /// Only process these source files
        #[arg(short, long = "file", value_name = "FILE")]
        files: Vec<String>,
    },

    /// Print the mapping fingerprint of a header list
    Fingerprint {
        /// Profile id
        #[arg(short, long, default_value_t = 1)]
        profile: i64,

        /// Column headers in order
        #[arg(required = true)]
        headers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            work_dir,
            config,
            profile,
            files,
        } => run(work_dir, config, profile, files).await,
        Commands::Fingerprint { profile, headers } => {
            println!("{}", Fingerprint::of_raw_headers(profile, &headers));
            Ok(())
        }
    }
}

async fn run(
    work_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    profile_path: Option<PathBuf>,
    files: Vec<String>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(dir) = work_dir {
        config = config.with_work_dir(dir);
    }
    init_tracing(&config.logging);

    let profiles = Arc::new(match &profile_path {
        Some(path) => InMemoryProfileStore::with_default(load_profile(path)?),
        None => InMemoryProfileStore::new(),
    });
    let factory = build_factory(&config).await?;
    let manager = TaskManager::new(&config, factory, profiles)
        .with_events(Arc::new(event_sink(&config.logging)));

    let mut definition = PipelineDefinition::standard();
    if !files.is_empty() {
        definition = definition.with_files(files);
    }
    let id = manager.submit(&definition)?;
    info!(task_id = %id, work_dir = %config.work_dir.display(), "Started");

    let snapshot = relay(&manager, &id).await?;
    match snapshot.status {
        TaskStatus::Failed => bail!(
            "task {id} failed: {}",
            snapshot.error_detail.unwrap_or_default()
        ),
        status => {
            for file in &snapshot.result_files {
                println!("=> {}", manager.area().destination().join(file).display());
            }
            info!(task_id = %id, %status, "Finished");
            Ok(())
        }
    }
}

fn load_profile(path: &Path) -> Result<ProfileDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read profile {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid profile {}", path.display()))
}

async fn build_factory(config: &EngineConfig) -> Result<StageFactory> {
    config.working_area().prepare().await?;
    let cache: Arc<dyn MappingCache> = match SqliteMappingCache::open(config.work_dir.join(CACHE_FILE)) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            warn!(error = %err, "Persistent mapping cache unavailable, using memory");
            Arc::new(InMemoryMappingCache::new())
        }
    };

    let (generator, extractor): (Arc<dyn MappingGenerator>, Arc<dyn TextExtractor>) =
        if config.model.is_configured() {
            let client = ChatClient::new(&config.model)?;
            info!(model = %client.model_id(), "Using model-backed extraction");
            (
                Arc::new(ChatMappingGenerator::new(client.clone())),
                Arc::new(ChatTextExtractor::new(client)),
            )
        } else {
            (
                Arc::new(HeaderMatchGenerator::new()),
                Arc::new(KeyValueTextExtractor::new()),
            )
        };

    let resolver = MappingResolver::new(cache, generator, config.model.timeout()?);
    Ok(StageFactory::new(resolver, extractor))
}

/// Stage and task events go to the log; a debug filter logs them at debug.
fn event_sink(logging: &LoggingConfig) -> LoggingEventSink {
    if logging.filter.contains("debug") || logging.filter.contains("trace") {
        LoggingEventSink::debug()
    } else {
        LoggingEventSink::default()
    }
}

/// Prints the task's log lines as they arrive; Ctrl-C requests cancellation.
async fn relay(manager: &TaskManager, id: &str) -> Result<TaskSnapshot> {
    let mut events = manager.subscribe(id);
    let mut printed = 0;
    let mut cancelling = false;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancelling => {
                signal?;
                cancelling = true;
                eprintln!("Cancelling...");
                manager.request_cancel(id);
            }
            event = next_event(&mut events) => {
                // Lines are read back from the snapshot so none are lost to a
                // late subscription.
                let snapshot = manager.get_status(id)?;
                for line in &snapshot.log[printed..] {
                    println!("{line}");
                }
                printed = snapshot.log.len();
                if event.is_none() || snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
            }
        }
    }
}

async fn next_event(events: &mut Option<Receiver<TaskEvent>>) -> Option<TaskEvent> {
    let rx = events.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}
