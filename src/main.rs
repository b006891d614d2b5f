use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use url_fetcher::config::Config;
use url_fetcher::{app, logging};

/// Fetch a list of URLs concurrently and report each result
#[derive(Parser, Debug)]
#[command(name = "url-fetcher", version, about)]
struct Args {
    /// File with one URL per line
    #[arg(long, required_unless_present = "prepare")]
    filepath: Option<PathBuf>,

    /// Write a default config file and exit
    #[arg(long)]
    prepare: bool,

    /// Config file [default: $CONFIG_PATH, then ./config.yml]
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config_path = Config::resolve_path(args.config, |key| std::env::var(key).ok());

    if args.prepare {
        return match Config::prepare(&config_path) {
            Ok(_) => {
                eprintln!("wrote default configuration to {}", config_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("prepare error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e} (run with --prepare to create {})", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logger) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let Some(filepath) = args.filepath else {
        tracing::error!("--filepath is required");
        return ExitCode::FAILURE;
    };

    match app::run(&config, filepath).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn load_config(path: &std::path::Path) -> url_fetcher::Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}
