use anyhow::{Context, Result};
use clap::Parser;
use flight::log_format::TargetFirstFormat;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Exit code for unrecoverable startup errors
const FATAL_EXIT_CODE: u8 = 255;

#[derive(Parser, Debug)]
#[command(
    name = "flight",
    version,
    about = "Serve a live board of recently observed aircraft"
)]
struct Cli {
    /// Configuration file (.toml, or .json for the legacy layout)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit without starting the server
    #[arg(long, default_value_t = false)]
    check_config: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::io::stderr().is_terminal();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(TargetFirstFormat::new(ansi));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(sentry_tracing::layer())
        .try_init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("FLIGHT_ENV").ok().map(Into::into),
            ..Default::default()
        },
    )))
}

fn serve(config: flight::Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Cannot build async runtime")?;

    runtime
        .block_on(flight::web::run(config))
        .context("Cannot run web server")
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _sentry = init_sentry();
    init_logging();

    // No socket is bound until the configuration has been validated
    let config = match flight::config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load configuration: {}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    if cli.check_config {
        info!("Configuration {:?} is valid", cli.config);
        return ExitCode::SUCCESS;
    }

    match serve(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}
