use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use tunicorn::arbiter::Arbiter;
use tunicorn::config::RawConfig;
use tunicorn::{app, config};

#[derive(Parser, Debug)]
#[command(author, version, about = "A pre-fork network server supervisor", long_about = None)]
struct Args {
    /// Application locator, `dotted.path[:callable_name]` (default callable is `application`).
    module: String,

    /// Path to a JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let raw = match &args.config {
        Some(path) => match load_config_file(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read configuration file");
                return ExitCode::from(1);
            }
        },
        None => RawConfig::default(),
    };

    let cfg = match raw.into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let application = match app::load(&args.module) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to load application");
            return ExitCode::from(config::APP_LOAD_ERROR as u8);
        }
    };

    let mut arbiter = match Arbiter::new(cfg, application) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "failed to initialize arbiter");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = arbiter.start() {
        error!(error = %e, "arbiter failed to start");
        return ExitCode::from(1);
    }

    let status = arbiter.run();
    ExitCode::from(status.rem_euclid(256) as u8)
}

fn load_config_file(path: &PathBuf) -> std::io::Result<RawConfig> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
