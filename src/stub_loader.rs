//! Parses the stub descriptor and uploads it to RAM via [`RomProtocol`],
//! confirming the stub's "OHAI" greeting before handing control to
//! [`crate::stub_protocol::StubProtocol`].

use std::time::Duration;

use serde::Deserialize;

use crate::connection::{SerialLink, Transport};
use crate::error::Error;
use crate::rom::RomProtocol;

/// Largest single RAM upload chunk; matches the ROM's MEM_DATA block
/// size ceiling used for ELF-to-RAM loads.
const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

const OHAI_POLL_ATTEMPTS: usize = 20;
const OHAI_POLL_INTERVAL: Duration = Duration::from_millis(10);
const OHAI_MARKER: &[u8] = b"OHAI";

/// Deserialized stub descriptor, as produced by the JSON stub
/// generator: `code`/`data` are hex strings, not base64.
#[derive(Clone, Debug, Deserialize)]
pub struct StubDescriptor {
    code: String,
    code_start: u32,
    #[serde(default)]
    data: String,
    data_start: u32,
    num_params: usize,
    params_start: u32,
    entry: u32,
}

impl StubDescriptor {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    fn code_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(hex::decode(&self.code)?)
    }

    fn data_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.data.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(hex::decode(&self.data)?)
        }
    }
}

fn check_param_count(expected: usize, actual: usize) -> Result<(), Error> {
    if expected != actual {
        log::error!("stub expects {expected} parameter(s), {actual} were provided");
        Err(Error::StubParamMismatch { expected, actual })
    } else {
        Ok(())
    }
}

fn upload_block(rom: &mut RomProtocol<impl SerialLink>, addr: u32, data: &[u8]) -> Result<(), Error> {
    let block_count = data.len().div_ceil(MAX_RAM_BLOCK_SIZE).max(1);
    rom.mem_begin(
        data.len() as u32,
        block_count as u32,
        MAX_RAM_BLOCK_SIZE as u32,
        addr,
    )?;
    for (seq, chunk) in data.chunks(MAX_RAM_BLOCK_SIZE.max(1)).enumerate() {
        rom.mem_data(chunk, seq as u32)?;
    }
    Ok(())
}

/// Upload `stub` to RAM and wait for its "OHAI" greeting. `params` must
/// have exactly `stub.num_params` entries (the only stub this crate
/// loads takes a single parameter: the target baud rate, 0 to keep the
/// current one). On success the caller's transport has already been
/// switched to the requested baud rate.
pub fn load_stub<L: SerialLink>(
    transport: &mut Transport<L>,
    stub: &StubDescriptor,
    params: &[u32],
    target_baud: u32,
) -> Result<(), Error> {
    check_param_count(stub.num_params, params.len())?;

    let code = stub.code_bytes()?;
    let data = stub.data_bytes()?;

    let mut params_and_code = Vec::with_capacity(params.len() * 4 + code.len());
    for param in params {
        params_and_code.extend_from_slice(&param.to_le_bytes());
    }
    params_and_code.extend_from_slice(&code);

    let mut rom = RomProtocol::new(transport);
    // No intermediate MEM_END between params+code and data: both are
    // plain MEM_BEGIN/DATA uploads, and a single MEM_END at the very
    // end triggers the jump to `entry`.
    upload_block(&mut rom, stub.params_start, &params_and_code)?;
    if !data.is_empty() {
        upload_block(&mut rom, stub.data_start, &data)?;
    }
    rom.mem_end(stub.entry)?;

    if target_baud != 0 {
        transport.set_baud_rate(target_baud)?;
    }

    for attempt in 1..=OHAI_POLL_ATTEMPTS {
        match transport.recv_frame(OHAI_POLL_INTERVAL) {
            Ok(frame) => {
                let greeted = frame
                    .windows(OHAI_MARKER.len())
                    .any(|window| window == OHAI_MARKER);
                log::debug!("OHAI poll {attempt}/{OHAI_POLL_ATTEMPTS}: got frame, greeted={greeted}");
                if greeted {
                    log::info!("stub greeted with OHAI");
                    return Ok(());
                }
            }
            Err(_) => {
                log::debug!("OHAI poll {attempt}/{OHAI_POLL_ATTEMPTS}: no frame yet");
            }
        }
    }

    log::error!("stub did not greet with OHAI after {OHAI_POLL_ATTEMPTS} attempts");
    Err(Error::StubNotReady)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StubDescriptor {
        StubDescriptor {
            code: hex::encode(b"stubcode"),
            code_start: 0x4010_0000,
            data: String::new(),
            data_start: 0,
            num_params: 1,
            params_start: 0x3FFE_8000,
            entry: 0x4010_0004,
        }
    }

    #[test]
    fn rejects_wrong_param_count() {
        let err = check_param_count(1, 0);
        assert!(matches!(
            err,
            Err(Error::StubParamMismatch {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn decodes_hex_code_and_data() {
        let stub = descriptor();
        assert_eq!(stub.code_bytes().unwrap(), b"stubcode");
        assert_eq!(stub.data_bytes().unwrap(), Vec::<u8>::new());
    }
}
