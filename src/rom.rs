//! Builds and parses ROM bootloader commands: SYNC, READ_REG, WRITE_REG,
//! MEM_BEGIN/DATA/END, FLASH_BEGIN/END, and the XOR checksum they use.

use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::connection::{SerialLink, Transport};
use crate::error::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

pub const OP_FLASH_BEGIN: u8 = 0x02;
pub const OP_FLASH_DATA: u8 = 0x03;
pub const OP_FLASH_END: u8 = 0x04;
pub const OP_MEM_BEGIN: u8 = 0x05;
pub const OP_MEM_END: u8 = 0x06;
pub const OP_MEM_DATA: u8 = 0x07;
pub const OP_SYNC: u8 = 0x08;
pub const OP_WRITE_REG: u8 = 0x09;
pub const OP_READ_REG: u8 = 0x0A;

/// Seed for the rolling XOR checksum used by MEM_DATA/FLASH_DATA.
pub const CHECKSUM_SEED: u8 = 0xEF;

pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |acc, byte| acc ^ byte)
}

const SYNC_PAYLOAD_HEAD: [u8; 4] = [0x07, 0x07, 0x12, 0x20];
const SYNC_PAYLOAD_TAIL: [u8; 32] = [0x55; 32];

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BeginParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BlockParams {
    size: u32,
    sequence: u32,
    dummy1: u32,
    dummy2: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct EntryParams {
    no_entry: u32,
    entry: u32,
}

fn expect_ok(status: &[u8]) -> Result<(), Error> {
    match status {
        [0x00, 0x00] => Ok(()),
        other => {
            let status = *other.get(1).unwrap_or(&0xFF);
            log::error!("ROM command failed with status {status:#04x}");
            Err(Error::RomError { op: 0, status })
        }
    }
}

/// ROM bootloader commands, built and parsed against a [`Transport`].
pub struct RomProtocol<'a, L: SerialLink> {
    transport: &'a mut Transport<L>,
}

impl<'a, L: SerialLink> RomProtocol<'a, L> {
    pub fn new(transport: &'a mut Transport<L>) -> Self {
        RomProtocol { transport }
    }

    /// Send SYNC up to 7 times; on the first acknowledged reply, drain
    /// whatever further echoes the ROM sends and return. `NotSynced` if
    /// none of the 7 attempts is acknowledged.
    pub fn sync(&mut self) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(36);
        payload.extend_from_slice(&SYNC_PAYLOAD_HEAD);
        payload.extend_from_slice(&SYNC_PAYLOAD_TAIL);

        for attempt in 1..=7 {
            log::debug!("SYNC attempt {attempt}/7");
            if self
                .transport
                .exchange(OP_SYNC, &payload, 0, SYNC_TIMEOUT)
                .is_ok()
            {
                log::debug!("SYNC acknowledged on attempt {attempt}");
                self.transport.drain_pending()?;
                return Ok(());
            }
        }
        log::error!("device did not acknowledge SYNC after 7 attempts");
        Err(Error::NotSynced)
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        log::debug!("READ_REG {addr:#010x}");
        let (val, _) = self
            .transport
            .exchange(OP_READ_REG, &addr.to_le_bytes(), 0, DEFAULT_TIMEOUT)?;
        log::debug!("READ_REG {addr:#010x} acknowledged: {val:#010x}");
        Ok(val)
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay_us: u32) -> Result<(), Error> {
        log::debug!("WRITE_REG {addr:#010x} <- {value:#010x} (mask {mask:#010x})");
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(&mask.to_le_bytes());
        payload.extend_from_slice(&delay_us.to_le_bytes());
        let (_, status) = self
            .transport
            .exchange(OP_WRITE_REG, &payload, 0, DEFAULT_TIMEOUT)?;
        let result = expect_ok(&status);
        if result.is_ok() {
            log::debug!("WRITE_REG {addr:#010x} acknowledged");
        }
        result
    }

    pub fn mem_begin(&mut self, total_size: u32, num_blocks: u32, block_size: u32, target_addr: u32) -> Result<(), Error> {
        log::debug!(
            "MEM_BEGIN at {target_addr:#010x}: {total_size} bytes in {num_blocks} block(s) of {block_size}"
        );
        let params = BeginParams {
            size: total_size,
            blocks: num_blocks,
            block_size,
            offset: target_addr,
        };
        let (_, status) = self
            .transport
            .exchange(OP_MEM_BEGIN, bytes_of(&params), 0, DEFAULT_TIMEOUT)?;
        expect_ok(&status)
    }

    pub fn mem_data(&mut self, block: &[u8], sequence: u32) -> Result<(), Error> {
        log::debug!("MEM_DATA block {sequence}: {} bytes", block.len());
        let params = BlockParams {
            size: block.len() as u32,
            sequence,
            dummy1: 0,
            dummy2: 0,
        };
        let mut payload = Vec::with_capacity(16 + block.len());
        payload.extend_from_slice(bytes_of(&params));
        payload.extend_from_slice(block);
        let (_, status) = self.transport.exchange(
            OP_MEM_DATA,
            &payload,
            xor_checksum(block) as u32,
            DEFAULT_TIMEOUT,
        )?;
        let result = expect_ok(&status);
        if result.is_ok() {
            log::debug!("MEM_DATA block {sequence} acknowledged");
        }
        result
    }

    pub fn mem_end(&mut self, entry: u32) -> Result<(), Error> {
        log::debug!("MEM_END, entry {entry:#010x}");
        let params = EntryParams {
            no_entry: (entry == 0) as u32,
            entry,
        };
        let (_, status) = self
            .transport
            .exchange(OP_MEM_END, bytes_of(&params), 0, DEFAULT_TIMEOUT)?;
        expect_ok(&status)
    }

    pub fn flash_begin(&mut self, erase_size: u32, num_blocks: u32, block_size: u32, offset: u32) -> Result<(), Error> {
        log::debug!(
            "FLASH_BEGIN at {offset:#010x}: erasing {erase_size} bytes, {num_blocks} block(s) of {block_size}"
        );
        let params = BeginParams {
            size: erase_size,
            blocks: num_blocks,
            block_size,
            offset,
        };
        let (_, status) = self
            .transport
            .exchange(OP_FLASH_BEGIN, bytes_of(&params), 0, DEFAULT_TIMEOUT)?;
        expect_ok(&status)
    }

    pub fn flash_end(&mut self, reboot: bool) -> Result<(), Error> {
        log::debug!("FLASH_END, reboot={reboot}");
        let payload = (!reboot as u32).to_le_bytes();
        let (_, status) = self
            .transport
            .exchange(OP_FLASH_END, &payload, 0, DEFAULT_TIMEOUT)?;
        expect_ok(&status)
    }
}

/// The ROM's quirky head-sector erase policy. Reproduced bit-exactly:
/// the ROM erases in 16-sector blocks aligned to `offset`, so a write
/// that starts mid-block only needs to erase the sectors it actually
/// touches in that first block.
pub fn erase_size(size: u32, offset: u32) -> u32 {
    const SECTOR_SIZE: u32 = 0x1000;
    const SECTORS_PER_BLOCK: u32 = 16;

    let num_sectors = size.div_ceil(SECTOR_SIZE);
    let start_sector = offset / SECTOR_SIZE;
    let head_sectors = SECTORS_PER_BLOCK - (start_sector % SECTORS_PER_BLOCK);
    let head_sectors = head_sectors.min(num_sectors);

    let erased = if num_sectors < 2 * head_sectors {
        num_sectors.div_ceil(2) * SECTOR_SIZE
    } else {
        (num_sectors - head_sectors) * SECTOR_SIZE
    };
    log::debug!(
        "erase size for {size} bytes at {offset:#010x}: {num_sectors} sector(s), {head_sectors} head sector(s) -> {erased} bytes"
    );
    erased
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn checksum_identity() {
        assert_eq!(xor_checksum(&[]), 0xEF);
        let data = [0x01, 0x02, 0x03, 0xAB];
        let mut doubled = data.to_vec();
        doubled.extend_from_slice(&data);
        assert_eq!(xor_checksum(&doubled), 0xEF);
    }

    #[test]
    fn erase_size_small_region_at_zero() {
        // size=0x4000, offset=0 -> num_sectors=4, head_sectors=16 (clamped
        // to 4), 2*head > num -> ceil(4/2)*sector = 0x2000.
        assert_eq!(erase_size(0x4000, 0), 0x2000);
    }

    #[test]
    fn erase_size_crosses_block_boundary() {
        // size=0x40000, offset=0x10000 -> num_sectors=64, start_sector=16,
        // head_sectors=16, erase = (64-16)*0x1000 = 0x30000.
        assert_eq!(erase_size(0x40000, 0x10000), 0x30000);
    }
}
