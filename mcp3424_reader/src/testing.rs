//! Bus double for tests: answers every read like an MCP3424 that always has data ready,
//! unless a response has been scripted for the address.

use std::collections::{HashMap, HashSet, VecDeque};

use mcp342x::{BusTransport, ConfigRegister, Error, ErrorKind, Resolution, NOT_READY};

#[derive(Debug, Clone)]
pub enum Response {
    /// Exact bytes, status byte included.
    Block(Vec<u8>),
    /// A ready conversion carrying this code.
    Code(i32),
    /// Conversion still running.
    NotReady,
    Fail,
}

#[derive(Debug, Default)]
pub struct ScriptedBus {
    scripted: HashMap<u8, VecDeque<Response>>,
    dead: HashSet<u8>,
    stuck: HashSet<u8>,
    log: Vec<(u8, u8, usize)>,
}

impl ScriptedBus {
    pub fn responsive() -> Self {
        Self::default()
    }

    pub fn with_dead_address(mut self, address: u8) -> Self {
        self.dead.insert(address);
        self
    }

    /// Never reports a finished conversion.
    pub fn with_stuck_address(mut self, address: u8) -> Self {
        self.stuck.insert(address);
        self
    }

    pub fn with_response(mut self, address: u8, response: Response) -> Self {
        self.scripted.entry(address).or_default().push_back(response);
        self
    }

    pub fn with_block(self, address: u8, block: Vec<u8>) -> Self {
        self.with_response(address, Response::Block(block))
    }

    pub fn with_code(self, address: u8, code: i32) -> Self {
        self.with_response(address, Response::Code(code))
    }

    pub fn push(&mut self, address: u8, response: Response) {
        self.scripted.entry(address).or_default().push_back(response);
    }

    pub fn reads(&self) -> usize {
        self.log.len()
    }

    /// Every read as (address, config byte, length).
    pub fn log(&self) -> &[(u8, u8, usize)] {
        &self.log
    }
}

/// Data bytes for `code` as the chip lays them out, sign extended into the first byte.
pub fn code_bytes(code: i32, resolution: Resolution) -> Vec<u8> {
    let bits = resolution.bits() as u32;
    let mask = (1u32 << bits) - 1;
    let mut value = (code as u32) & mask;
    if code < 0 {
        value |= !mask;
    }
    match resolution {
        Resolution::Bits18 => vec![(value >> 16) as u8, (value >> 8) as u8, value as u8],
        _ => vec![(value >> 8) as u8, value as u8],
    }
}

impl BusTransport for ScriptedBus {
    fn read_block(&mut self, address: u8, config: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.log.push((address, config, buf.len()));
        if self.dead.contains(&address) {
            return Err(Error::I2c { address, kind: ErrorKind::Other });
        }
        let ready = config & !NOT_READY;
        if self.stuck.contains(&address) {
            buf.fill(0);
            buf[buf.len() - 1] = config | NOT_READY;
            return Ok(());
        }
        let resolution = ConfigRegister::decode(config).resolution;
        let response = self
            .scripted
            .get_mut(&address)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Response::Code(0));
        match response {
            Response::Block(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
            }
            Response::Code(code) => {
                let data = code_bytes(code, resolution);
                buf[..data.len()].copy_from_slice(&data);
                buf[buf.len() - 1] = ready;
            }
            Response::NotReady => {
                buf.fill(0);
                buf[buf.len() - 1] = config | NOT_READY;
            }
            Response::Fail => return Err(Error::I2c { address, kind: ErrorKind::Other }),
        }
        Ok(())
    }
}
