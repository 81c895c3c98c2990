mod cli;
mod cmd;
mod command;
mod config;
mod logger;
mod probe;
mod sandbox;
mod spinner;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "lethe-sandbox start");

    match cli::run() {
        Ok(result) => {
            info!("lethe-sandbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "lethe-sandbox failed");
            Err(err)
        }
    }
}
