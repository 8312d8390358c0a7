use std::env;
use std::process::ExitCode;

use mcp342x::ConfigRegister;

/// Print the decoding of each MCP3424 status/config byte given as an argument.
fn main() -> ExitCode {
    let mut status = ExitCode::SUCCESS;
    for arg in env::args().skip(1) {
        let digits = arg.trim_start_matches("0x").trim_start_matches("0X");
        match u8::from_str_radix(digits, 16) {
            Ok(byte) => println!("{}", ConfigRegister::decode(byte)),
            Err(e) => {
                eprintln!("{arg}: {e}");
                status = ExitCode::FAILURE;
            }
        }
    }
    status
}
