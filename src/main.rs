use std::env::consts::{ARCH, FAMILY, OS};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, trace};

use crate::harvest::{init_config, init_logger, run_cli, Args};

mod harvest;

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let config_manager = init_config(&args.config_dir)?;
    let config = config_manager.get_app_config()?;

    // Held until the end of `run` so the file writer flushes before exit.
    let logger = Arc::new(init_logger(&config)?);
    log_system_information();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(run_cli(args, &config_manager, logger.clone()))?;
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    Ok(code)
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:    \"{}\"", ARCH);
    trace!("FAMILY:  \"{}\"", FAMILY);
    trace!("OS:      \"{}\"", OS);
}
