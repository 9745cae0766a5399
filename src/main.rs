use clap::Parser;

use relbrowse_daemon::dispatch::{Dispatcher, DEFAULT_MAX_REQUEST_BYTES};
use relbrowse_daemon::logger;

/// Multi-driver relational database browser daemon. Owns connections and
/// runs queries on behalf of a client speaking JSON-RPC over this process's
/// stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "relbrowse-daemon", version)]
struct Cli {
    /// Accept JSON-RPC requests on stdin and reply on stdout. Currently the
    /// only supported transport; the flag exists so a future transport
    /// doesn't have to change the default invocation shape.
    #[arg(long, default_value_t = true)]
    stdio: bool,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    max_request_bytes: usize,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    let buffer = logger::create_log_buffer(1000);
    logger::init_logger(buffer, cli.log_level.into());

    log::info!("relbrowse-daemon starting, max_request_bytes={}", cli.max_request_bytes);

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let mut dispatcher = Dispatcher::new(cli.max_request_bytes);
    let result = dispatcher.run(&rt);

    log::info!("relbrowse-daemon exiting");
    result
}
