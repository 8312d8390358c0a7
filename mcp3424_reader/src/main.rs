use std::process::ExitCode;

use mcp3424_reader::config::Settings;
use mcp3424_reader::{monitor, Error};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit status for a missing calibration entry.
const EXIT_CALIBRATION: u8 = 112;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber.");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Keyboard interrupt, stopping after this round.");
            ctrl_c.cancel();
        }
    });

    match monitor(&settings, cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            match e.downcast_ref::<Error>() {
                Some(Error::MissingCalibration { .. }) => ExitCode::from(EXIT_CALIBRATION),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
