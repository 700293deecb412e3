//! Consultation signaling server entry point
//!
//! Serves the JSON-RPC 2.0 signaling protocol over WebSocket for virtual
//! consultation sessions.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:8080, in-memory store, ./recordings
//! cargo run -p telehealth-consult-server
//!
//! # Load a TOML config and override single settings
//! cargo run -p telehealth-consult-server -- \
//!   --config ./consult.toml \
//!   --bind 127.0.0.1:9000 \
//!   --store sqlite --store-path ./consult.db
//!
//! # Short timers for local testing, JSON logs
//! CONSULT_GRACE_PERIOD_MS=2000 CONSULT_IDLE_TIMEOUT_MS=30000 \
//!   cargo run -p telehealth-consult-server -- --log-json
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telehealth_consult::config::{ConsultConfig, StoreBackend};
use telehealth_consult::store::open_store;
use telehealth_consult::{SessionManager, WebSocketSignalingServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Virtual consultation signaling server
///
/// Settings come from the optional TOML file first; flags and CONSULT_*
/// environment variables override them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CONSULT_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(long, env = "CONSULT_BIND_ADDRESS")]
    bind: Option<String>,

    /// Reconnect grace period in milliseconds
    #[arg(long, env = "CONSULT_GRACE_PERIOD_MS")]
    grace_period_ms: Option<u64>,

    /// Idle timeout of an ACTIVE session in milliseconds
    #[arg(long, env = "CONSULT_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,

    /// Chat messages retained per session for replay
    #[arg(long, env = "CONSULT_CHAT_HISTORY_LIMIT")]
    chat_history_limit: Option<usize>,

    /// Quality sampling interval in milliseconds
    #[arg(long, env = "CONSULT_SAMPLE_INTERVAL_MS")]
    sample_interval_ms: Option<u64>,

    /// Packet loss fraction at which quality becomes fair
    #[arg(long, env = "CONSULT_FAIR_LOSS_THRESHOLD")]
    fair_loss_threshold: Option<f64>,

    /// Packet loss fraction at which quality becomes poor
    #[arg(long, env = "CONSULT_POOR_LOSS_THRESHOLD")]
    poor_loss_threshold: Option<f64>,

    /// Directory for recording files
    #[arg(long, env = "CONSULT_RECORDING_DIR")]
    recording_dir: Option<PathBuf>,

    /// Persistence backend
    #[arg(long, env = "CONSULT_STORE")]
    store: Option<StoreArg>,

    /// SQLite database file (sqlite backend only)
    #[arg(long, env = "CONSULT_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "CONSULT_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "CONSULT_LOG_JSON")]
    log_json: bool,

    /// Worker threads (default: number of CPUs)
    #[arg(long, env = "CONSULT_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StoreArg {
    /// In-process maps, lost on restart
    Memory,
    /// SQLite database file
    Sqlite,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Memory => StoreBackend::Memory,
            StoreArg::Sqlite => StoreBackend::Sqlite,
        }
    }
}

impl Args {
    /// Merge the TOML file (if any) with command line overrides
    fn load_config(&self) -> telehealth_consult::Result<ConsultConfig> {
        let mut config = match &self.config {
            Some(path) => ConsultConfig::from_toml_file(path)?,
            None => ConsultConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(ms) = self.grace_period_ms {
            config.session.grace_period_ms = ms;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.session.idle_timeout_ms = ms;
        }
        if let Some(limit) = self.chat_history_limit {
            config.session.chat_history_limit = limit;
        }
        if let Some(ms) = self.sample_interval_ms {
            config.quality.sample_interval_ms = ms;
        }
        if let Some(fair) = self.fair_loss_threshold {
            config.quality.fair_loss_threshold = fair;
        }
        if let Some(poor) = self.poor_loss_threshold {
            config.quality.poor_loss_threshold = poor;
        }
        if let Some(dir) = &self.recording_dir {
            config.recording.directory = dir.clone();
        }
        if let Some(store) = self.store {
            config.store.backend = store.into();
        }
        if let Some(path) = &self.store_path {
            config.store.path = Some(path.clone());
        }
        if let Some(stun) = &self.stun_servers {
            config.ice.stun_servers = stun.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, ending sessions...");

        std::thread::spawn(|| {
            std::thread::sleep(std::time::Duration::from_secs(10));
            eprintln!("Graceful shutdown timeout (10s), forcing exit");
            std::process::exit(1);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads.unwrap_or_else(num_cpus::get))
        .thread_name("consult-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json);

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    info!(
        version = telehealth_consult::version(),
        bind_address = %config.server.bind_address,
        store = ?config.store.backend,
        recording_dir = %config.recording.directory.display(),
        grace_period_ms = config.session.grace_period_ms,
        idle_timeout_ms = config.session.idle_timeout_ms,
        webrtc_backend = cfg!(feature = "webrtc"),
        "Consultation signaling server starting"
    );

    let store = open_store(&config.store)?;
    let manager = SessionManager::new(&config, store);

    let server = WebSocketSignalingServer::new(
        config.server.bind_address.clone(),
        manager.clone(),
        config.server.channel_capacity,
    )
    .start()
    .await?;

    info!(addr = %server.local_addr(), "Server running. Press Ctrl+C to shutdown.");

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, cleaning up...");
    server.shutdown().await;
    manager.shutdown().await;
    info!("Consultation signaling server shut down gracefully");

    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG wins; otherwise info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
