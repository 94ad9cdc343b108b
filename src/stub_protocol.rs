//! Speaks the stub's streaming flash protocol once it has greeted with
//! "OHAI": flash write with a credit window and MD5 verification, flash
//! read with a matching ack mirror, flash digest, and boot-firmware.
//!
//! Unlike ROM commands, stub command headers are single SLIP frames
//! with no 8-byte envelope; the bulk data pushed during FLASH_WRITE is
//! written to the wire unframed (no byte-stuffing) since escaping every
//! byte of a flash image would defeat the point of the fast path.

use std::time::Duration;

use crate::connection::{SerialLink, Transport};
use crate::error::Error;
use crate::progress::ProgressCallbacks;

const OP_FLASH_WRITE: u8 = 1;
const OP_FLASH_READ: u8 = 2;
const OP_FLASH_DIGEST: u8 = 3;
const OP_BOOT_FW: u8 = 6;

const WRITE_CHUNK: usize = 1024;
const WRITE_CREDIT: usize = 2048;
const READ_BLOCK_SIZE: u32 = 32;
const READ_MAX_IN_FLIGHT: u32 = 64;
const SECTOR_SIZE: u32 = 0x1000;
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

fn le_words(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

fn expect_status(frame: &[u8]) -> Result<u8, Error> {
    if frame.len() == 1 {
        Ok(frame[0])
    } else {
        Err(Error::ExpectedStatusCode(frame.to_vec()))
    }
}

fn expect_digest(frame: &[u8]) -> Result<[u8; 16], Error> {
    frame
        .try_into()
        .map_err(|_| Error::ExpectedDigest(frame.to_vec()))
}

/// Stub commands, driven directly over a [`Transport`] after
/// [`crate::stub_loader::load_stub`] has confirmed the greeting.
pub struct StubProtocol<'a, L: SerialLink> {
    transport: &'a mut Transport<L>,
}

impl<'a, L: SerialLink> StubProtocol<'a, L> {
    pub fn new(transport: &'a mut Transport<L>) -> Self {
        StubProtocol { transport }
    }

    /// Stream `data` to `address` with credit-based flow control,
    /// verifying the stub's MD5 of what it received. `address` and
    /// `data.len()` must already be sector-aligned.
    pub fn flash_write(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if address % SECTOR_SIZE != 0 {
            let msg = format!("address {address:#x} is not sector aligned");
            log::error!("FLASH_WRITE rejected: {msg}");
            return Err(Error::WrongArguments(msg));
        }
        if data.len() as u32 % SECTOR_SIZE != 0 {
            let msg = format!(
                "payload length {} is not a multiple of the sector size",
                data.len()
            );
            log::error!("FLASH_WRITE rejected: {msg}");
            return Err(Error::WrongArguments(msg));
        }

        log::debug!("FLASH_WRITE {address:#010x}: {} bytes", data.len());
        self.transport.send_frame(&[OP_FLASH_WRITE])?;
        self.transport
            .send_frame(&le_words(&[address, data.len() as u32, 1]))?;

        progress.init(address, data.len());

        let mut sent = 0usize;
        let mut written = 0usize;
        while written < data.len() {
            let frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
            match frame.len() {
                4 => {
                    written = u32::from_le_bytes(frame.try_into().unwrap()) as usize;
                    log::trace!("FLASH_WRITE credit update: {written} bytes written so far");
                    progress.update(written);
                }
                1 => {
                    log::error!("FLASH_WRITE failed with status {}", frame[0]);
                    return Err(Error::WriteFailure(frame[0]));
                }
                _ => return Err(Error::UnexpectedData),
            }

            while sent < data.len() && sent - written < WRITE_CREDIT {
                let end = (sent + WRITE_CHUNK).min(data.len());
                self.transport.write_raw(&data[sent..end])?;
                sent = end;
            }
        }

        let digest_frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
        let got = expect_digest(&digest_frame)?;
        let expected: [u8; 16] = md5::compute(data).0;
        if got != expected {
            log::error!("FLASH_WRITE MD5 mismatch: got {got:02x?}, expected {expected:02x?}");
            return Err(Error::DigestMismatch {
                got: got.to_vec(),
                expected: expected.to_vec(),
            });
        }

        let status_frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
        let status = expect_status(&status_frame)?;
        if status != 0 {
            log::error!("FLASH_WRITE closing status reported failure: {status}");
            return Err(Error::WriteFailure(status));
        }

        log::debug!("FLASH_WRITE {address:#010x} verified");
        progress.finish();
        Ok(())
    }

    /// Read `size` bytes from `address`, acking received bytes with a
    /// running counter and verifying the stub's closing MD5.
    pub fn flash_read(&mut self, address: u32, size: u32) -> Result<Vec<u8>, Error> {
        log::debug!("FLASH_READ {address:#010x}: {size} bytes");
        self.transport.send_frame(&[OP_FLASH_READ])?;
        self.transport.send_frame(&le_words(&[
            address,
            size,
            READ_BLOCK_SIZE,
            READ_MAX_IN_FLIGHT,
        ]))?;

        let mut memory = Vec::with_capacity(size as usize);
        loop {
            let chunk = self.transport.recv_frame(REPLY_TIMEOUT)?;
            memory.extend_from_slice(&chunk);
            self.transport
                .send_frame(&(memory.len() as u32).to_le_bytes())?;

            if memory.len() as u32 == size {
                break;
            }
            if memory.len() as u32 > size {
                log::error!(
                    "FLASH_READ received {} bytes, more than the requested {size}",
                    memory.len()
                );
                return Err(Error::ReadError);
            }
        }

        let digest_frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
        let got = expect_digest(&digest_frame)?;
        let expected: [u8; 16] = md5::compute(&memory).0;
        if got != expected {
            log::error!("FLASH_READ MD5 mismatch: got {got:02x?}, expected {expected:02x?}");
            return Err(Error::DigestMismatch {
                got: got.to_vec(),
                expected: expected.to_vec(),
            });
        }

        let status_frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
        let status = expect_status(&status_frame)?;
        if status != 0 {
            log::error!("FLASH_READ closing status reported failure: {status}");
            return Err(Error::WriteFailure(status));
        }

        log::debug!("FLASH_READ {address:#010x} verified, {size} bytes");
        Ok(memory)
    }

    /// Collect a sequence of 16 byte MD5 digests covering `address..
    /// address+size` in `block_size`-sized chunks, terminated by a
    /// status byte.
    pub fn flash_digest(
        &mut self,
        address: u32,
        size: u32,
        block_size: u32,
    ) -> Result<Vec<[u8; 16]>, Error> {
        log::debug!("FLASH_DIGEST {address:#010x}: {size} bytes in blocks of {block_size}");
        self.transport.send_frame(&[OP_FLASH_DIGEST])?;
        self.transport
            .send_frame(&le_words(&[address, size, block_size]))?;

        let mut digests = Vec::new();
        loop {
            let frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
            match frame.len() {
                16 => digests.push(expect_digest(&frame)?),
                1 => {
                    let status = frame[0];
                    return if status == 0 {
                        log::debug!("FLASH_DIGEST collected {} block digest(s)", digests.len());
                        Ok(digests)
                    } else {
                        log::error!("FLASH_DIGEST closing status reported failure: {status}");
                        Err(Error::WriteFailure(status))
                    };
                }
                _ => return Err(Error::UnexpectedData),
            }
        }
    }

    /// Reboot into user firmware.
    pub fn boot_fw(&mut self) -> Result<(), Error> {
        log::debug!("BOOT_FW");
        self.transport.send_frame(&[OP_BOOT_FW])?;
        let status_frame = self.transport.recv_frame(REPLY_TIMEOUT)?;
        let status = expect_status(&status_frame)?;
        if status != 0 {
            log::error!("BOOT_FW reported failure: {status}");
            return Err(Error::WriteFailure(status));
        }
        Ok(())
    }
}
