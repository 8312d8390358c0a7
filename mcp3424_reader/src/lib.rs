//! Multi-port voltage monitor for MCP3424 expansion boards.
//!
//! Each board carries two MCP3424 chips behind R1/R2 dividers, giving eight differential
//! ports per board and up to 32 ports on one I2C bus. The run probes the bus once, then
//! samples the selected ports in rounds, logging one record per port per round.

use std::error::Error as StdError;

use linux_embedded_hal::I2cdev;
use mcp342x::{Gain, Mcp3424Bus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use calibration::CalibrationTable;
use config::Settings;
use registry::DeviceRegistry;
use sampler::{RunOutcome, Sampler, SamplerOptions};

pub mod autotune;
pub mod average;
pub mod calibration;
pub mod config;
pub mod conversion;
pub mod registry;
pub mod sampler;

#[cfg(test)]
pub(crate) mod testing;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] mcp342x::Error),
    #[error("no calibration constants for {bits} bits at gain {gain}")]
    MissingCalibration { bits: u8, gain: u8 },
    #[error("port {port} not ready after {tries} reads")]
    NotReady { port: u8, tries: u32 },
    #[error("cancelled while waiting on port {port}")]
    Cancelled { port: u8 },
    #[error("{0} chip addresses given, boards need them in pairs")]
    OddAddressCount(usize),
    #[error("port {0} is not registered")]
    NoSuchPort(u8),
    #[error("no MCP3424 answered on the bus")]
    NoPorts,
}

/// Probe the bus and sample until done or cancelled.
pub async fn monitor(settings: &Settings, cancel: CancellationToken) -> Result<RunOutcome, Box<dyn StdError>> {
    let i2c = I2cdev::new(&settings.i2c_device)?;
    let mut bus = Mcp3424Bus::new(i2c);

    let registry = DeviceRegistry::build(
        &mut bus,
        &settings.addresses,
        settings.resolution,
        settings.gain.unwrap_or(Gain::G1),
        settings.divider,
    )?;
    if registry.max_port() == 0 {
        return Err(Error::NoPorts.into());
    }
    info!("Registry built, {} ports on {}", registry.max_port(), settings.i2c_device);

    let options = SamplerOptions {
        ports: settings.ports.clone(),
        samples: settings.samples,
        delay: settings.delay,
        auto_gain: settings.gain.is_none(),
        calibrate_v: settings.calibrate_v,
        poll_limit: settings.poll_limit,
    };
    let mut sampler = Sampler::new(bus, registry, CalibrationTable::measured(), options);

    let outcome = sampler.run(&cancel, |record| info!("{}", record)).await?;
    info!("Sampling stopped: {:?}", outcome);
    Ok(outcome)
}
