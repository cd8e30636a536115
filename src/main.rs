use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use suctionsense::backend::{IngestorHandle, IngestorSettings, TopicRouter};
use suctionsense::config::{BackendConfig, EdgeConfig};
use suctionsense::edge::DeviceAgent;
use suctionsense::store::StateStore;
use suctionsense::transport::link::HostLink;
use suctionsense::transport::loopback::Loopback;
use suctionsense::transport::mqtt::MqttSession;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const USAGE: &str = "usage: suctionsense edge [--dry-run] [CONFIG] | suctionsense backend [CONFIG]";

enum Command {
    Edge { dry_run: bool, config: Option<PathBuf> },
    Backend { config: Option<PathBuf> },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let (mode, rest) = args.split_first().ok_or_else(|| eyre!(USAGE))?;
        let mut dry_run = false;
        let mut config = None;
        for arg in rest {
            match arg.as_str() {
                "--dry-run" if mode == "edge" => dry_run = true,
                flag if flag.starts_with("--") => return Err(eyre!("unknown option {}\n{}", flag, USAGE)),
                path if config.is_none() => config = Some(PathBuf::from(path)),
                extra => return Err(eyre!("unexpected argument {}\n{}", extra, USAGE)),
            }
        }
        match mode.as_str() {
            "edge" => Ok(Command::Edge { dry_run, config }),
            "backend" => Ok(Command::Backend { config }),
            other => Err(eyre!("unknown mode {}\n{}", other, USAGE)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match Command::parse(&args)? {
        Command::Edge { dry_run, config } => run_edge(config, dry_run).await,
        Command::Backend { config } => run_backend(config).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, stopping");
                token.cancel();
            }
            Err(e) => error!("Unable to listen for Ctrl-C: {}", e),
        }
    });
    cancel
}

async fn run_edge(config: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let config = EdgeConfig::load(config.as_deref()).await?;
    info!(
        "Edge device {} reporting room {} on {}",
        config.device_id,
        config.room,
        config.state_topic()
    );
    let cancel = cancel_on_ctrl_c();

    let stats = if dry_run {
        warn!("Dry run: publishing to an in-process loopback instead of the broker");
        let loopback = Loopback::new();
        DeviceAgent::from_config(&config, loopback.link(), loopback.session())?
            .run(cancel)
            .await
    } else {
        let link = HostLink::new(config.link.interface.clone());
        let session = MqttSession::new(config.broker.clone(), config.device_id.clone());
        DeviceAgent::from_config(&config, link, session)?.run(cancel).await
    };

    info!(
        "Edge agent finished after {} ticks: {} transitions, {} publishes, {} failed",
        stats.ticks, stats.transitions, stats.publishes, stats.failed_publishes
    );
    Ok(())
}

async fn run_backend(config: Option<PathBuf>) -> Result<()> {
    let config = BackendConfig::load(config.as_deref()).await?;

    let store = match &config.database.path {
        Some(path) => StateStore::open_sqlite(path)?,
        None => {
            warn!("No database path configured, room state is kept in memory");
            StateStore::in_memory()
        }
    };
    let store = Arc::new(store);
    store.seed_rooms(&config.seed_rooms).await?;

    let router = TopicRouter::new(store.clone(), config.absent_fields);
    let mut ingestor = IngestorHandle::spawn(IngestorSettings::from_config(&config), router);
    info!("Ingesting {} (Ctrl-C to stop)", ingestor.topic_filter);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Unable to listen for Ctrl-C: {}", e))?;
    let stats = ingestor.shutdown().await?;
    info!(
        "Ingestor stopped: {} received, {} applied, {} dropped, {} failed",
        stats.received, stats.applied, stats.dropped, stats.failed
    );

    for room in store.list_rooms().await? {
        info!(
            "{}: suction_on={} occupancy={} updated_at={:?}",
            room.number, room.suction_on, room.occupancy, room.updated_at
        );
    }
    Ok(())
}
