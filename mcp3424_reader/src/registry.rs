//! Port numbering and bus discovery.
//!
//! Ports are numbered 1..=32. Each board carries two chips with four channels each:
//! ports 1-4 are chip 1 of board 1, ports 5-8 chip 2 of board 1, ports 9-12 chip 1 of
//! board 2, and so on. Chip addresses are consumed two per board in that order.

use mcp342x::{BusTransport, Channel, ConfigRegister, ConversionMode, Gain, Resolution};
use tracing::{debug, info, warn};

use crate::conversion::{Divider, Reading};
use crate::Error;

pub const MAX_PORTS: u8 = 32;
pub const CHIPS_PER_BOARD: u8 = 2;

/// Fixed wiring and settings of one port.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortConfig {
    pub port: u8,
    pub board: u8,
    /// 1 or 2 within the board.
    pub chip: u8,
    pub channel: Channel,
    pub address: u8,
    pub resolution: Resolution,
    pub divider: Divider,
}

impl PortConfig {
    /// Register value that starts (and keeps) conversions for this port at `gain`.
    pub fn register(&self, gain: Gain) -> ConfigRegister {
        ConfigRegister::new(self.channel, self.resolution, gain, ConversionMode::Continuous)
    }

    /// One register read for this port. The returned block holds `block_len()` valid bytes.
    pub fn read_block<B: BusTransport>(&self, bus: &mut B, gain: Gain) -> Result<[u8; 4], mcp342x::Error> {
        let mut buf = [0u8; 4];
        let len = self.resolution.block_len();
        bus.read_block(self.address, self.register(gain).encode(), &mut buf[..len])?;
        Ok(buf)
    }
}

/// Values updated by every read of a port.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortState {
    pub gain: Gain,
    pub block: [u8; 4],
    pub status: u8,
    /// Reads needed until the last conversion reported ready.
    pub tries: u32,
    pub reading: Option<Reading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub config: PortConfig,
    pub state: PortState,
}

impl Port {
    /// Store a freshly read block.
    pub fn record_block(&mut self, block: [u8; 4]) {
        self.state.block = block;
        self.state.status = block[self.config.resolution.block_len() - 1];
    }

    /// Data bytes of the last block, without the status byte.
    pub fn data_bytes(&self) -> &[u8] {
        &self.state.block[..self.config.resolution.block_len() - 1]
    }
}

/// Ports found on the bus at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    ports: Vec<Port>,
}

impl DeviceRegistry {
    /// Walk boards, chips and channels in order, probing each port with one read.
    ///
    /// Discovery stops at the first port whose chip address is missing or does not
    /// answer; the ports before it make up the registry.
    #[tracing::instrument(skip(bus, divider))]
    pub fn build<B: BusTransport>(
        bus: &mut B,
        addresses: &[u8],
        resolution: Resolution,
        gain: Gain,
        divider: Divider,
    ) -> Result<Self, Error> {
        if addresses.len() % CHIPS_PER_BOARD as usize != 0 {
            return Err(Error::OddAddressCount(addresses.len()));
        }

        let mut ports = Vec::new();
        'probe: for port in 1..=MAX_PORTS {
            let index = (port - 1) / 4;
            let board = index / CHIPS_PER_BOARD + 1;
            let chip = index % CHIPS_PER_BOARD + 1;
            let channel = Channel::ALL[((port - 1) % 4) as usize];

            let Some(&address) = addresses.get(index as usize) else {
                debug!("No address for board {} chip {}, {} ports registered", board, chip, ports.len());
                break 'probe;
            };
            let config = PortConfig { port, board, chip, channel, address, resolution, divider };
            match config.read_block(bus, gain) {
                Ok(block) => {
                    let mut entry = Port {
                        config,
                        state: PortState { gain, block, status: 0, tries: 1, reading: None },
                    };
                    entry.record_block(block);
                    ports.push(entry);
                }
                Err(e) => {
                    warn!("Port {} (0x{:02x} channel {}) did not respond: {}", port, address, channel.number(), e);
                    break 'probe;
                }
            }
        }

        info!("{} ports registered", ports.len());
        Ok(Self { ports })
    }

    /// Highest registered port number, 0 when nothing answered.
    pub fn max_port(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn get(&self, port: u8) -> Option<&Port> {
        self.ports.get((port as usize).checked_sub(1)?)
    }

    pub fn get_mut(&mut self, port: u8) -> Option<&mut Port> {
        self.ports.get_mut((port as usize).checked_sub(1)?)
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }
}
