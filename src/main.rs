mod clock;
mod config;
mod diagnostics;
mod dom_projector;
mod durable_store;
mod enrichment_cache;
mod enrichment_queue;
mod error;
mod label_resolver;
mod lookup;
mod pipeline;
mod protocol;
mod rate_controller;
mod result_store;
mod timeline;

use std::{
    path::{Path, PathBuf},
    rc::Rc,
    thread,
    time::Duration,
};

use clock::PipelineClock;
use config::{sanitize_config, Config};
use durable_store::{DurableStore, MemoryKvStore, SqliteKvStore};
use log::{info, warn};
use lookup::http::HttpProfileFetcher;
use pipeline::{LoopControl, Pipeline, PipelineParts};
use result_store::ResultStore;
use timeline::document::{FeedCommand, TimelineDocument};
use tokio::sync::{mpsc, watch};

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("regionmark").join("config.toml"))
}

fn load_config(config_file: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if !config_file.exists() {
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        std::fs::write(config_file, toml::to_string(&Config::default())?)?;
    }

    let config_content = std::fs::read_to_string(config_file)?;
    let config = match toml::from_str::<Config>(&config_content) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                "Failed to parse config file, using defaults. path={} error={}",
                config_file.display(),
                err
            );
            Config::default()
        }
    };
    Ok(sanitize_config(config))
}

fn open_durable_store(config: &Config) -> Rc<dyn DurableStore> {
    let path = config
        .store
        .database_file
        .clone()
        .or_else(SqliteKvStore::default_path);
    let Some(path) = path else {
        warn!("No data directory available; results will not survive a restart");
        return Rc::new(MemoryKvStore::new());
    };
    match SqliteKvStore::open(&path) {
        Ok(store) => {
            info!("Result store opened at {}", path.display());
            Rc::new(store)
        }
        Err(err) => {
            warn!(
                "Failed to open result store, falling back to memory. path={} error={}",
                path.display(),
                err
            );
            Rc::new(MemoryKvStore::new())
        }
    }
}

/// Forwards stdin lines to the runtime. Dropping the sender signals EOF.
fn spawn_stdin_reader(lines: mpsc::UnboundedSender<String>) {
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("Failed to read stdin: {}", err);
                    break;
                }
            }
        }
    });
}

async fn feed_document(
    document: Rc<TimelineDocument>,
    mut lines: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Sender<bool>,
) {
    while let Some(line) = lines.recv().await {
        match FeedCommand::parse(&line) {
            Some(command) => command.apply(&document),
            None if line.trim().is_empty() => {}
            None => warn!("Ignoring unrecognised input line: {}", line.trim()),
        }
    }
    info!("Input closed, shutting down");
    let _ = shutdown.send(true);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_file = config_file_path().ok_or("no config directory available")?;
    let config = load_config(&config_file)?;
    log::set_max_level(config.diagnostics.level_filter());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    let (line_sender, line_receiver) = mpsc::unbounded_channel();
    spawn_stdin_reader(line_sender);

    runtime.block_on(async move {
        let clock = PipelineClock::system();
        let store = ResultStore::new(
            open_durable_store(&config),
            config.store.storage_key.clone(),
            config.store.expiry_horizon(),
        );
        match store.purge_expired(clock.now_unix_ms()).await {
            Ok(0) => {}
            Ok(removed) => info!("Purged {} expired results", removed),
            Err(err) => warn!("Failed to purge expired results: {}", err),
        }

        let document = Rc::new(TimelineDocument::new().with_echo());
        let pipeline = Pipeline::new(
            &config,
            PipelineParts {
                fetcher: HttpProfileFetcher::new(config.network.clone()),
                discovery: Rc::clone(&document),
                render: Rc::clone(&document),
                store,
                clock,
            },
        );

        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let snapshots = pipeline.subscribe_diagnostics();
        let panel_shutdown = shutdown_receiver.clone();
        let panel_enabled = config.diagnostics.panel_enabled;
        let poll_interval = Duration::from_millis(config.diagnostics.poll_interval_ms);

        tokio::join!(
            pipeline.run(LoopControl::new(shutdown_receiver)),
            async move {
                if panel_enabled {
                    diagnostics::run_panel(snapshots, poll_interval, panel_shutdown).await;
                }
            },
            feed_document(Rc::clone(&document), line_receiver, shutdown_sender),
        );
    });

    Ok(())
}
