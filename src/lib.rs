// Subrelay - Reddit to X relay bot
// Module declarations

use clap::Parser;
use std::error::Error;
use std::process::ExitCode;

pub mod cli;
pub mod compose;
pub mod config;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod proxy;
pub mod reddit;
pub mod state;
pub mod twitter;

fn log_error_chain(err: &dyn Error) {
    log::error!("{}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        log::error!("  caused by: {}", cause);
        source = cause.source();
    }
}

/// Parse arguments, run the command and map the result to an exit code
pub fn run() -> ExitCode {
    // Before parsing, so clap's env fallbacks see .env values too
    let dotenv = config::load_dotenv();
    let cli = cli::Cli::parse();

    logging::init_logging(Some(&cli.log_file));
    match dotenv {
        Ok(Some(path)) => log::info!("Loaded environment from {}", path.display()),
        Ok(None) => {}
        Err(e) => log::warn!("Ignoring unreadable .env file: {}", e),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(cli::execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error_chain(&e);
            ExitCode::FAILURE
        }
    }
}
