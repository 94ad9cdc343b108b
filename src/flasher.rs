//! Orchestrates a flashing run: connect, sync, load the stub, write each
//! segment, optionally reboot. The source drove this from a worker
//! thread signalled by request/reply completions; here it is a plain
//! sequential procedure the embedding application can run on whatever
//! thread it likes.

use std::thread::sleep;
use std::time::Duration;

use crate::connection::{SerialLink, Transport};
use crate::error::Error;
use crate::progress::ProgressCallbacks;
use crate::rom::{self, RomProtocol};
use crate::stub_loader::{self, StubDescriptor};
use crate::stub_protocol::StubProtocol;

pub const SECTOR_SIZE: u32 = 0x1000;
pub const FLASH_BLOCK_SIZE: u32 = 0x400;
pub const RAM_BLOCK_SIZE: u32 = 0x1800;
pub const ROM_BAUD_DEFAULT: u32 = 115_200;

/// The empirical settle delay between two FLASH_WRITE operations. The
/// stub has no ack for "ready for the next segment"; do not replace
/// this with one (spec'd behavior, not an oversight).
const INTER_SEGMENT_DELAY: Duration = Duration::from_millis(100);

const OTP_MAC0: u32 = 0x3FF0_0050;
const OTP_MAC1: u32 = 0x3FF0_0054;
/// Part of the OTP MAC register map; the chip ID formula only needs
/// MAC0/MAC1.
#[allow(dead_code)]
const OTP_MAC3: u32 = 0x3FF0_005C;

const FLASH_ID_REG_A: u32 = 0x6000_0240;
const FLASH_ID_REG_B: u32 = 0x6000_0200;

const HEADER_MAGIC: u8 = 0xE9;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashSize {
    Flash4M = 0x00,
    Flash2M = 0x10,
    Flash8M = 0x20,
    Flash16M = 0x30,
    Flash32M = 0x40,
    Flash16MC1 = 0x50,
    Flash32MC1 = 0x60,
    Flash32MC2 = 0x70,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashFrequency {
    Freq40M = 0,
    Freq26M = 1,
    Freq20M = 2,
    Freq80M = 0xF,
}

/// An image to flash: a target address and its payload. Built once per
/// run from a bundle (or a single file for the CLI's `write-flash`),
/// padded to a sector boundary and (optionally) header-patched before
/// it is written.
#[derive(Clone, Debug)]
pub struct Segment {
    pub address: u32,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(address: u32, payload: Vec<u8>) -> Self {
        Segment { address, payload }
    }

    /// Patch bytes 2 and 3 of an ESP application image header in place,
    /// if this segment is one (`address == 0` and `payload[0] == 0xE9`).
    /// Any other segment is left untouched.
    pub fn patch_header(&mut self, mode: FlashMode, size: FlashSize, freq: FlashFrequency) {
        if self.address == 0 && self.payload.first() == Some(&HEADER_MAGIC) && self.payload.len() > 3 {
            self.payload[2] = mode as u8;
            self.payload[3] = size as u8 | freq as u8;
        }
    }

    /// Pad the payload up to the next sector boundary with `0xFF`. A
    /// no-op if it is already sector-aligned.
    pub fn pad_to_sector(&mut self) {
        let remainder = self.payload.len() as u32 % SECTOR_SIZE;
        if remainder != 0 {
            let pad = (SECTOR_SIZE - remainder) as usize;
            self.payload.extend(std::iter::repeat(0xFFu8).take(pad));
        }
    }
}

/// High-level states the run passes through, exposed for logging; the
/// procedure below does not dispatch on this explicitly, it simply
/// advances through them in order and returns early on failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Opened,
    Syncing,
    Synced,
    StubLoading,
    StubReady,
    Writing,
    Rebooting,
    Done,
}

/// Drives one flashing run over a single [`Transport`].
pub struct Flasher<L: SerialLink> {
    transport: Transport<L>,
    state: State,
    stub_active: bool,
}

impl<L: SerialLink> Flasher<L> {
    pub fn new(link: L) -> Self {
        Flasher {
            transport: Transport::new(link),
            state: State::Opened,
            stub_active: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cancel_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.transport.cancel_handle()
    }

    /// Pulse the device into the ROM bootloader and sync with it.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.state = State::Syncing;
        self.transport.bootstrap_bootloader()?;
        self.transport.flush()?;
        RomProtocol::new(&mut self.transport).sync()?;
        log::info!("synced with ROM bootloader");
        self.state = State::Synced;
        Ok(())
    }

    /// Load `stub` to RAM, switch to `stub_baud` (0 keeps the current
    /// rate), and wait for its greeting.
    pub fn load_stub(&mut self, stub: &StubDescriptor, stub_baud: u32) -> Result<(), Error> {
        self.state = State::StubLoading;
        stub_loader::load_stub(&mut self.transport, stub, &[stub_baud], stub_baud)?;
        self.stub_active = true;
        self.state = State::StubReady;
        Ok(())
    }

    /// The 32-bit chip ID, derived from the OTP MAC registers.
    pub fn chip_id(&mut self) -> Result<u32, Error> {
        let mut rom = RomProtocol::new(&mut self.transport);
        let mac0 = rom.read_reg(OTP_MAC0)?;
        let mac1 = rom.read_reg(OTP_MAC1)?;
        Ok((mac0 >> 24) | ((mac1 & 0x00FF_FFFF) << 8))
    }

    /// The raw flash ID word, via the ROM's flash-probe register dance.
    pub fn flash_id(&mut self) -> Result<u32, Error> {
        let mut rom = RomProtocol::new(&mut self.transport);
        rom.flash_begin(0, 0, FLASH_BLOCK_SIZE, 0)?;
        rom.write_reg(FLASH_ID_REG_A, 0, 0xFFFF_FFFF, 0)?;
        rom.write_reg(FLASH_ID_REG_B, 0x1000_0000, 0xFFFF_FFFF, 0)?;
        let id = rom.read_reg(FLASH_ID_REG_A)?;
        rom.flash_end(false)?;
        Ok(id)
    }

    /// Write every segment in `segments` in order (callers are expected
    /// to have already sorted them ascending by address, per
    /// [`crate::bundle`]). Each segment is header-patched (if it is a
    /// boot image at address 0) and padded to a sector boundary here,
    /// per spec: patching/padding is part of this orchestration step,
    /// not something a caller does before handing segments over.
    /// Requires [`Flasher::load_stub`] to have succeeded first.
    pub fn write_segments(
        &mut self,
        segments: &mut [Segment],
        mode: FlashMode,
        size: FlashSize,
        freq: FlashFrequency,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if !self.stub_active {
            return Err(Error::StubNotLoaded);
        }

        let mut first = true;
        for segment in segments.iter_mut() {
            if segment.payload.is_empty() {
                continue;
            }
            segment.patch_header(mode, size, freq);
            segment.pad_to_sector();

            if !first {
                sleep(INTER_SEGMENT_DELAY);
            }
            first = false;

            self.state = State::Writing;
            log::info!(
                "writing segment at {:#010x} ({} bytes)",
                segment.address,
                segment.payload.len()
            );
            StubProtocol::new(&mut self.transport).flash_write(
                segment.address,
                &segment.payload,
                progress,
            )?;
            self.state = State::StubReady;
        }

        Ok(())
    }

    /// Read `size` bytes of flash starting at `address`. Requires a
    /// loaded stub.
    pub fn read_flash(&mut self, address: u32, size: u32) -> Result<Vec<u8>, Error> {
        if !self.stub_active {
            return Err(Error::StubNotLoaded);
        }
        StubProtocol::new(&mut self.transport).flash_read(address, size)
    }

    /// Reboot into user firmware.
    pub fn reboot(&mut self) -> Result<(), Error> {
        self.state = State::Rebooting;
        StubProtocol::new(&mut self.transport).boot_fw()?;
        self.state = State::Done;
        Ok(())
    }
}

/// The ROM's quirky head-sector erase policy, re-exported for callers
/// that want to report the size that will actually be erased before
/// writing. See [`rom::erase_size`] for the formula itself.
pub fn erase_size(size: u32, offset: u32) -> u32 {
    rom::erase_size(size, offset)
}
