//! MCP3424 ADC register codec and bus access over any embedded-hal 1.0 I2C bus.
//!
//! The MCP3424 has a single configuration register. Writing it selects the channel,
//! conversion mode, resolution and PGA gain; reading the chip returns the conversion
//! result followed by the same register, whose top bit is the "not ready" flag.

use std::fmt;
use std::time::Duration;

use embedded_hal::i2c::{Error as _, I2c};
use thiserror::Error;

pub use embedded_hal::i2c::ErrorKind;

/// Errors for the MCP342x bus layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("I2C bus error at address 0x{address:02x}: {kind:?}")]
    I2c { address: u8, kind: ErrorKind },
    #[error("Unsupported block length {0}, expected 3 or 4 bytes")]
    BlockLength(usize),
    #[error("{len} data bytes, {expected} needed")]
    ShortData { len: usize, expected: usize },
}

/// Set on write to start a conversion, set on read while the result is not ready.
pub const NOT_READY: u8 = 0b1000_0000;
pub const CH_MASK: u8 = 0b0110_0000;
pub const CONT_MASK: u8 = 0b0001_0000;
pub const RES_MASK: u8 = 0b0000_1100;
pub const GAIN_MASK: u8 = 0b0000_0011;

/// Full differential input span (2 * 2.048 V reference).
pub const FULL_SCALE_VOLTS: f64 = 4.096;

/// PGA gain settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gain {
    G1 = 0b00, // 2.048V
    G2 = 0b01, // 1.024V
    G4 = 0b10, // 0.512V
    G8 = 0b11, // 0.256V
}

impl Gain {
    pub const ALL: [Gain; 4] = [Gain::G1, Gain::G2, Gain::G4, Gain::G8];

    pub fn from_factor(factor: u8) -> Option<Self> {
        match factor {
            1 => Some(Gain::G1),
            2 => Some(Gain::G2),
            4 => Some(Gain::G4),
            8 => Some(Gain::G8),
            _ => None,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & GAIN_MASK {
            0b00 => Gain::G1,
            0b01 => Gain::G2,
            0b10 => Gain::G4,
            _ => Gain::G8,
        }
    }

    /// Amplification factor (1, 2, 4 or 8).
    pub fn factor(self) -> u8 {
        1 << (self as u8)
    }

    /// Next higher gain, `None` at 8.
    pub fn step_up(self) -> Option<Self> {
        match self {
            Gain::G1 => Some(Gain::G2),
            Gain::G2 => Some(Gain::G4),
            Gain::G4 => Some(Gain::G8),
            Gain::G8 => None,
        }
    }

    /// Next lower gain, `None` at 1.
    pub fn step_down(self) -> Option<Self> {
        match self {
            Gain::G1 => None,
            Gain::G2 => Some(Gain::G1),
            Gain::G4 => Some(Gain::G2),
            Gain::G8 => Some(Gain::G4),
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.factor())
    }
}

/// Conversion resolution and SPS timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Bits12 = 0b0000, // 240 SPS, 1 mV
    Bits14 = 0b0100, // 60 SPS, 250 uV
    Bits16 = 0b1000, // 15 SPS, 62.5 uV
    Bits18 = 0b1100, // 3.75 SPS, 15.625 uV
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Bits12,
        Resolution::Bits14,
        Resolution::Bits16,
        Resolution::Bits18,
    ];

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            12 => Some(Resolution::Bits12),
            14 => Some(Resolution::Bits14),
            16 => Some(Resolution::Bits16),
            18 => Some(Resolution::Bits18),
            _ => None,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & RES_MASK {
            0b0000 => Resolution::Bits12,
            0b0100 => Resolution::Bits14,
            0b1000 => Resolution::Bits16,
            _ => Resolution::Bits18,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Resolution::Bits12 => 12,
            Resolution::Bits14 => 14,
            Resolution::Bits16 => 16,
            Resolution::Bits18 => 18,
        }
    }

    /// Number of bytes returned by a read: data bytes plus the status byte.
    pub fn block_len(self) -> usize {
        if self == Resolution::Bits18 { 4 } else { 3 }
    }

    /// Volts per code at gain 1.
    pub fn lsb(self) -> f64 {
        FULL_SCALE_VOLTS / (1u32 << self.bits()) as f64
    }

    /// Number of distinct codes, 2^bits.
    pub fn span(self) -> i32 {
        1 << self.bits()
    }

    pub fn samples_per_second(self) -> f64 {
        match self {
            Resolution::Bits12 => 240.0,
            Resolution::Bits14 => 60.0,
            Resolution::Bits16 => 15.0,
            Resolution::Bits18 => 3.75,
        }
    }

    /// Expected duration of one conversion.
    pub fn conversion_time(self) -> Duration {
        Duration::from_secs_f64(1.0 / self.samples_per_second())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Input channel selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Ch1 = 0b0000000,
    Ch2 = 0b0100000,
    Ch3 = 0b1000000,
    Ch4 = 0b1100000,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Ch1, Channel::Ch2, Channel::Ch3, Channel::Ch4];

    fn from_code(code: u8) -> Self {
        match code & CH_MASK {
            0b0000000 => Channel::Ch1,
            0b0100000 => Channel::Ch2,
            0b1000000 => Channel::Ch3,
            _ => Channel::Ch4,
        }
    }

    pub fn number(self) -> u8 {
        ((self as u8) >> 5) + 1
    }
}

/// One-shot or continuous conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionMode {
    OneShot,
    Continuous,
}

/// The MCP3424 configuration register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigRegister {
    /// On write: start a conversion. On read: result not yet ready.
    pub not_ready: bool,
    pub channel: Channel,
    pub mode: ConversionMode,
    pub resolution: Resolution,
    pub gain: Gain,
}

impl ConfigRegister {
    /// Register contents that trigger a conversion with the given settings.
    pub fn new(channel: Channel, resolution: Resolution, gain: Gain, mode: ConversionMode) -> Self {
        ConfigRegister { not_ready: true, channel, mode, resolution, gain }
    }

    pub fn encode(&self) -> u8 {
        let mut c = (self.channel as u8) | (self.resolution as u8) | (self.gain as u8);
        if self.not_ready {
            c |= NOT_READY;
        }
        if self.mode == ConversionMode::Continuous {
            c |= CONT_MASK;
        }
        c
    }

    /// Every bit pattern maps onto a register value; all fields are fully populated.
    pub fn decode(byte: u8) -> Self {
        ConfigRegister {
            not_ready: byte & NOT_READY != 0,
            channel: Channel::from_code(byte),
            mode: if byte & CONT_MASK != 0 { ConversionMode::Continuous } else { ConversionMode::OneShot },
            resolution: Resolution::from_code(byte),
            gain: Gain::from_code(byte),
        }
    }

    /// True when `status` reports the same settings as `self`, ignoring the ready flag.
    pub fn matches_status(&self, status: u8) -> bool {
        (self.encode() & !NOT_READY) == (status & !NOT_READY)
    }
}

impl fmt::Display for ConfigRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}: ", self.encode())?;
        if self.not_ready {
            write!(f, "data NOT ready")?;
        } else {
            write!(f, "Data ready")?;
        }
        write!(f, ", Channel {}, ", self.channel.number())?;
        match self.mode {
            ConversionMode::Continuous => write!(f, "Continuous mode")?,
            ConversionMode::OneShot => write!(f, "One shot")?,
        }
        write!(
            f,
            ", {} bits/ {} SPS, PGA = {}",
            self.resolution.bits(),
            self.resolution.samples_per_second(),
            self.gain
        )
    }
}

/// Decode the data bytes of a block into a signed code.
///
/// The chip sign-extends the result into the unused high bits of the first byte,
/// so the top bit of `bytes[0]` is the sign. Any trailing status byte is ignored.
pub fn decode_raw_code(bytes: &[u8], resolution: Resolution) -> Result<i32, Error> {
    let expected = resolution.block_len() - 1;
    if bytes.len() < expected {
        return Err(Error::ShortData { len: bytes.len(), expected });
    }
    let b0 = bytes[0] as i32;
    let b1 = bytes[1] as i32;
    let mut code = match resolution {
        Resolution::Bits18 => (b0 & 0x03) << 16 | b1 << 8 | bytes[2] as i32,
        Resolution::Bits16 => b0 << 8 | b1,
        Resolution::Bits14 => (b0 & 0x3f) << 8 | b1,
        Resolution::Bits12 => (b0 & 0x0f) << 8 | b1,
    };
    if b0 & 0x80 != 0 {
        code -= resolution.span();
    }
    Ok(code)
}

/// The status byte that trails the data bytes of a block, `None` for an empty block.
pub fn status_byte(block: &[u8]) -> Option<u8> {
    block.last().copied()
}

/// Register read primitive: write `config`, then read `buf.len()` bytes back.
pub trait BusTransport {
    fn read_block(&mut self, address: u8, config: u8, buf: &mut [u8]) -> Result<(), Error>;
}

/// MCP342x chips sharing one I2C bus.
pub struct Mcp3424Bus<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> Mcp3424Bus<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Mcp3424Bus { i2c }
    }
}

impl<I2C: I2c> BusTransport for Mcp3424Bus<I2C> {
    fn read_block(&mut self, address: u8, config: u8, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != 3 && buf.len() != 4 {
            return Err(Error::BlockLength(buf.len()));
        }
        self.i2c
            .write_read(address, &[config], buf)
            .map_err(|e| Error::I2c { address, kind: e.kind() })
    }
}

impl<T: BusTransport + ?Sized> BusTransport for &mut T {
    fn read_block(&mut self, address: u8, config: u8, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read_block(address, config, buf)
    }
}
