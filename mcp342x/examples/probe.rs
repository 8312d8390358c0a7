use linux_embedded_hal::I2cdev;
use mcp342x::{
    decode_raw_code, status_byte, BusTransport, Channel, ConfigRegister, ConversionMode, Gain, Mcp3424Bus, Resolution,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let i2c = I2cdev::new("/dev/i2c-1")?;
    let mut bus = Mcp3424Bus::new(i2c);
    let res = Resolution::Bits16;
    let config = ConfigRegister::new(Channel::Ch1, res, Gain::G1, ConversionMode::Continuous).encode();
    let mut buf = [0u8; 4];
    let block = &mut buf[..res.block_len()];
    let mut tries = 0;
    loop {
        tries += 1;
        bus.read_block(0x68, config, block)?;
        if block.last().is_some_and(|&status| ConfigRegister::decode(status).not_ready) {
            std::thread::sleep(res.conversion_time() / 4);
            continue;
        }
        break;
    }
    let code = decode_raw_code(block, res)?;
    if let Some(status) = status_byte(block) {
        println!("{}", ConfigRegister::decode(status));
    }
    println!("code={}, voltage={:.6} V after {} tries", code, code as f64 * res.lsb(), tries);
    Ok(())
}
