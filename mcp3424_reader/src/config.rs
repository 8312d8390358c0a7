//! Run settings, read from `MCP3424_*` environment variables.

use std::time::Duration;

use mcp342x::{Gain, Resolution};
use thiserror::Error;

use crate::conversion::Divider;
use crate::registry::MAX_PORTS;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Parse { var: &'static str, value: String, reason: String },
    #[error("address 0x{0:02x} is not a 7-bit I2C address")]
    Address(u32),
    #[error("port {0} outside 1..=32")]
    Port(u32),
    #[error("bits must be one of 12, 14, 16, 18, got {0}")]
    Bits(u8),
    #[error("gain must be one of 1, 2, 4, 8, got {0}")]
    Gain(u8),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub i2c_device: String,
    pub addresses: Vec<u8>,
    /// Ports to sample, in the order given.
    pub ports: Vec<u8>,
    pub resolution: Resolution,
    /// Fixed gain; `None` starts at 1 and auto-tunes.
    pub gain: Option<Gain>,
    pub samples: u32,
    pub delay: Duration,
    pub divider: Divider,
    pub calibrate_v: Option<f64>,
    /// Max reads while waiting for a conversion; `None` waits forever.
    pub poll_limit: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            i2c_device: "/dev/i2c-1".to_string(),
            addresses: vec![0x68, 0x69, 0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f],
            ports: (1..=8).collect(),
            resolution: Resolution::Bits18,
            gain: None,
            samples: 1,
            delay: Duration::from_millis(1500),
            divider: Divider { r1: 120_000.0, r2: 20_000.0 },
            calibrate_v: None,
            poll_limit: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut s = Settings::default();

        if let Some(v) = get("MCP3424_I2C_DEVICE") {
            s.i2c_device = v;
        }
        if let Some(v) = get("MCP3424_ADDRESSES") {
            s.addresses = parse_addresses(&v)?;
        }
        if let Some(v) = get("MCP3424_PORTS") {
            s.ports = parse_ports(&v)?;
        }
        if let Some(v) = get("MCP3424_BITS") {
            let bits: u8 = parse_number("MCP3424_BITS", &v)?;
            s.resolution = Resolution::from_bits(bits).ok_or(ConfigError::Bits(bits))?;
        }
        if let Some(v) = get("MCP3424_GAIN") {
            let factor: u8 = parse_number("MCP3424_GAIN", &v)?;
            s.gain = Some(Gain::from_factor(factor).ok_or(ConfigError::Gain(factor))?);
        }
        if let Some(v) = get("MCP3424_SAMPLES") {
            s.samples = parse_number("MCP3424_SAMPLES", &v)?;
        }
        if let Some(v) = get("MCP3424_DELAY") {
            let secs: f64 = parse_number("MCP3424_DELAY", &v)?;
            s.delay = Duration::try_from_secs_f64(secs)
                .map_err(|e| ConfigError::Invalid(format!("MCP3424_DELAY {secs}: {e}")))?;
        }
        if let Some(v) = get("MCP3424_R1") {
            s.divider.r1 = parse_number("MCP3424_R1", &v)?;
        }
        if let Some(v) = get("MCP3424_R2") {
            s.divider.r2 = parse_number("MCP3424_R2", &v)?;
        }
        if let Some(v) = get("MCP3424_CALIBRATE") {
            s.calibrate_v = Some(parse_number("MCP3424_CALIBRATE", &v)?);
        }
        if let Some(v) = get("MCP3424_POLL_LIMIT") {
            s.poll_limit = Some(parse_number("MCP3424_POLL_LIMIT", &v)?);
        }

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.samples == 0 {
            return Err(ConfigError::Invalid("samples must be at least 1".into()));
        }
        if !(self.divider.r1 >= 0.0 && self.divider.r1.is_finite()) {
            return Err(ConfigError::Invalid(format!("R1 must be >= 0 ohms, got {}", self.divider.r1)));
        }
        if self.divider.r1 > 0.0 && !(self.divider.r2 > 0.0 && self.divider.r2.is_finite()) {
            return Err(ConfigError::Invalid(format!("R2 must be > 0 ohms, got {}", self.divider.r2)));
        }
        if let Some(v) = self.calibrate_v {
            if !v.is_finite() {
                return Err(ConfigError::Invalid(format!("calibration voltage {v} is not finite")));
            }
            if !self.divider.is_active() {
                return Err(ConfigError::Invalid("calibration needs a divider (R1 > 0)".into()));
            }
        }
        if self.poll_limit == Some(0) {
            return Err(ConfigError::Invalid("poll limit must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Parse {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a comma separated address list.
///
/// If any entry contains a hex letter the whole list is hex, so `"6e,6f"` needs no
/// prefix. Otherwise entries are decimal unless prefixed with `0x`.
pub fn parse_addresses(list: &str) -> Result<Vec<u8>, ConfigError> {
    let hex = list.chars().any(|c| matches!(c, 'a'..='f' | 'A'..='F'));
    list.split(',')
        .map(str::trim)
        .map(|entry| {
            let prefixed = entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X"));
            let parsed = match (hex, prefixed) {
                (_, Some(digits)) => u32::from_str_radix(digits, 16),
                (true, None) => u32::from_str_radix(entry, 16),
                (false, None) => entry.parse::<u32>(),
            };
            let address = parsed.map_err(|e| ConfigError::Parse {
                var: "MCP3424_ADDRESSES",
                value: entry.to_string(),
                reason: e.to_string(),
            })?;
            u8::try_from(address)
                .ok()
                .filter(|a| *a <= 0x7f)
                .ok_or(ConfigError::Address(address))
        })
        .collect()
}

/// Parse a port selection such as `"1,3-5"` into `[1, 3, 4, 5]`. Ranges are inclusive.
pub fn parse_ports(list: &str) -> Result<Vec<u8>, ConfigError> {
    let mut ports = Vec::new();
    for item in list.split(',').map(str::trim) {
        let bad = |reason: &str| ConfigError::Parse {
            var: "MCP3424_PORTS",
            value: item.to_string(),
            reason: reason.to_string(),
        };
        let (first, last) = match item.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (item, item),
        };
        let first: u32 = first.parse().map_err(|_| bad("not a port number"))?;
        let last: u32 = last.parse().map_err(|_| bad("not a port number"))?;
        if first > last {
            return Err(bad("range end before start"));
        }
        for port in first..=last {
            if port == 0 || port > MAX_PORTS as u32 {
                return Err(ConfigError::Port(port));
            }
            ports.push(port as u8);
        }
    }
    Ok(ports)
}
