use carelink_hub::{serve, AppointmentStore, HubConfig, HubState, TokenTable};
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:4780";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    tokens_file: Option<PathBuf>,
    seed_file: Option<PathBuf>,
    debug: bool,
    ping_interval: Duration,
    write_timeout: Duration,
    stale_after: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "carelink-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// JSON file mapping session tokens to principals.
    #[arg(long, default_value = "")]
    tokens: String,
    /// JSON array of appointments loaded at startup.
    #[arg(long, default_value = "")]
    seed: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    /// Close connections silent for this long; 0 disables.
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_addr", addr = %addr);
    }

    let tokens = match &config.tokens_file {
        Some(path) => match TokenTable::load(path) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "tokens_error", error = %err);
                return;
            }
        },
        None => TokenTable::default(),
    };
    if tokens.is_empty() {
        warn!(event = "no_tokens", "every connection will be rejected");
    }
    let store = match &config.seed_file {
        Some(path) => match AppointmentStore::load(path) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "seed_error", error = %err);
                return;
            }
        },
        None => AppointmentStore::new(),
    };
    info!(event = "store_ready", appointments = store.len().await);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = Arc::new(HubState::new(
        HubConfig {
            debug: config.debug,
            ping_interval: config.ping_interval,
            write_timeout: config.write_timeout,
            stale_after: config.stale_after,
        },
        tokens,
        Arc::new(store),
        shutdown_rx,
    ));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = serve(listener, hub).await {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        tokens_file: resolve_path(&args.tokens, "CARELINK_TOKENS_FILE"),
        seed_file: resolve_path(&args.seed, "CARELINK_SEED_FILE"),
        debug: args.debug || env_true("CARELINK_HUB_DEBUG"),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        stale_after: Duration::from_secs(args.stale_seconds),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CARELINK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees every formatted line to stdout and, when configured, the log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("carelink-hub-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_non_empty("CARELINK_HUB_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_path(flag: &str, env_key: &str) -> Option<PathBuf> {
    if !flag.trim().is_empty() {
        return Some(PathBuf::from(flag));
    }
    env_non_empty(env_key).map(PathBuf::from)
}

/// Empty means no log file; lines still go to stdout.
fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_non_empty("CARELINK_LOG_DIR").unwrap_or_default()
}
