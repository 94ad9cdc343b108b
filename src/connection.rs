//! Owns the serial link: framed request/reply exchange and the DTR/RTS
//! bootloader-entry bootstrap.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use binread::io::Cursor;
use binread::{BinRead, BinReaderExt};

use crate::error::Error;
use crate::slip::{self, SlipDecoder};

/// The DTR/RTS pulse spacing and the per-poll read granularity are
/// empirical timings the ROM bootloader genuinely needs; don't replace
/// them with acks.
const RESET_PULSE_DELAY: Duration = Duration::from_millis(50);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_ATTEMPTS: usize = 100;

/// Narrow interface Transport needs from whatever owns the wire: byte
/// I/O plus the handful of serial-port control lines the bootstrap and
/// baud-rate upgrade touch.
pub trait SerialLink: Read + Write {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error>;
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;
    fn set_rts(&mut self, level: bool) -> Result<(), Error>;
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
}

/// [`SerialLink`] backed by a real OS serial port, via the `serial` crate.
pub struct SerialPortLink {
    inner: Box<dyn serial::SerialPort>,
}

impl SerialPortLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let mut port = serial::open(path).map_err(|_| Error::PortOpen)?;
        port.reconfigure(&|settings| settings.set_baud_rate(to_serial_baud(baud)))?;
        Ok(SerialPortLink {
            inner: Box::new(port),
        })
    }
}

fn to_serial_baud(baud: u32) -> serial::BaudRate {
    serial::BaudRate::from_speed(baud as usize)
}

impl Read for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl SerialLink for SerialPortLink {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        self.inner
            .reconfigure(&|settings| settings.set_baud_rate(to_serial_baud(baud)))?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.inner.set_dtr(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.inner.set_rts(level)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.inner.set_timeout(timeout)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, BinRead)]
struct ReplyHeader {
    resp: u8,
    op_ret: u8,
    len_ret: u16,
    val: u32,
}

/// Owns one serial link for the lifetime of a flashing run and speaks
/// the SLIP-framed request/reply protocol over it.
pub struct Transport<L: SerialLink> {
    link: L,
    decoder: SlipDecoder,
    cancelled: Arc<AtomicBool>,
}

impl<L: SerialLink> Transport<L> {
    pub fn new(link: L) -> Self {
        Transport {
            link,
            decoder: SlipDecoder::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle the embedding application can flip from another thread
    /// to cooperatively cancel the run.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Pulse RTS/DTR to drop the ESP8266 into the ROM bootloader, then
    /// flush the link. Exact transitions and spacing per the bootloader
    /// protocol; do not "simplify" these.
    pub fn bootstrap_bootloader(&mut self) -> Result<(), Error> {
        self.link.set_dtr(false)?;
        self.link.set_rts(true)?;
        sleep(RESET_PULSE_DELAY);

        self.link.set_dtr(true)?;
        self.link.set_rts(false)?;
        sleep(RESET_PULSE_DELAY);

        self.link.set_dtr(false)?;

        self.link.flush()?;
        Ok(())
    }

    pub fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        self.link.set_baud_rate(baud)
    }

    /// SLIP-encode `payload` and write it to the link as one frame.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.check_cancelled()?;
        let encoded = slip::encode(payload);
        self.link.write_all(&encoded)?;
        Ok(())
    }

    /// Write bytes directly to the link with no SLIP framing. Used for
    /// the bulk data pushes in the stub's streaming flash-write
    /// protocol, which are not escaped on the wire.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.check_cancelled()?;
        self.link.write_all(bytes)?;
        Ok(())
    }

    /// Read whatever bytes are available within `budget` and feed them
    /// to the decoder, returning any frames that completed.
    fn poll(&mut self, budget: Duration) -> Result<Vec<Vec<u8>>, Error> {
        self.link.set_read_timeout(budget)?;
        let mut buf = [0u8; 256];
        let mut frames = Vec::new();
        match self.link.read(&mut buf) {
            Ok(0) => log::trace!("poll read 0 bytes"),
            Ok(n) => {
                log::trace!("poll read {n} bytes");
                self.decoder.feed(&buf[..n], &mut frames)?;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                log::trace!("poll timed out with no bytes available");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::trace!("poll would block with no bytes available");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(frames)
    }

    /// Read a single arbitrary frame within `timeout`, for the stub
    /// protocol which has no 8-byte ROM header to match against.
    pub fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.check_cancelled()?;
            for frame in self.poll(POLL_INTERVAL)? {
                return Ok(frame);
            }
        }
        log::error!("timed out after {timeout:?} waiting for a frame");
        Err(Error::ReadError)
    }

    /// Write one framed ROM command and poll for a reply whose
    /// `op_ret` matches (or any reply, if `op == 0`) within `timeout`.
    /// Mismatched or malformed replies are silently skipped: the ROM
    /// echoes and emits debug noise that must not poison the exchange.
    pub fn exchange(
        &mut self,
        op: u8,
        payload: &[u8],
        chk: u32,
        timeout: Duration,
    ) -> Result<(u32, Vec<u8>), Error> {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.push(0x00);
        frame.push(op);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&chk.to_le_bytes());
        frame.extend_from_slice(payload);
        self.send_frame(&frame)?;

        let deadline = Instant::now() + timeout;
        for _ in 0..POLL_ATTEMPTS {
            if Instant::now() >= deadline {
                break;
            }
            self.check_cancelled()?;
            for reply in self.poll(POLL_INTERVAL)? {
                if reply.len() < 8 {
                    continue;
                }
                let mut cursor = Cursor::new(&reply);
                let header: ReplyHeader = match cursor.read_le() {
                    Ok(header) => header,
                    Err(_) => continue,
                };
                if header.resp != 0x01 {
                    continue;
                }
                if op != 0 && header.op_ret != op {
                    continue;
                }
                let data = reply[8..].to_vec();
                return Ok((header.val, data));
            }
        }
        log::error!("timed out after {timeout:?} waiting for op {op:#04x} reply");
        Err(Error::ReadError)
    }

    /// Drain whatever frames the ROM is still echoing after a
    /// successful sync, discarding them.
    pub fn drain_pending(&mut self) -> Result<(), Error> {
        for _ in 0..5 {
            if self.poll(POLL_INTERVAL)?.is_empty() {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.link.flush()?;
        Ok(())
    }
}

/// An in-memory [`SerialLink`] for driving `Transport` in tests without
/// real hardware. Public (not `#[cfg(test)]`-gated) so integration
/// tests in `tests/` can build scenarios against it too. Cheaply
/// cloneable (an `Rc<RefCell<_>>` handle) so a test can keep a handle
/// to inspect what was written after handing a clone to a `Transport`.
pub mod fake {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::rc::Rc;
    use std::time::Duration;

    use super::SerialLink;
    use crate::error::Error;

    #[derive(Default)]
    struct Inner {
        to_host: VecDeque<u8>,
        from_host: Vec<u8>,
        baud_history: Vec<u32>,
        dtr_history: Vec<bool>,
        rts_history: Vec<bool>,
    }

    #[derive(Clone, Default)]
    pub struct FakeLink(Rc<RefCell<Inner>>);

    impl FakeLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes the fake ROM/stub will hand back on the next reads.
        pub fn push_incoming(&self, bytes: &[u8]) {
            self.0.borrow_mut().to_host.extend(bytes.iter().copied());
        }

        /// Everything written to the link so far (SLIP-framed command
        /// bytes and any unframed bulk pushes).
        pub fn written(&self) -> Vec<u8> {
            self.0.borrow().from_host.clone()
        }

        pub fn baud_history(&self) -> Vec<u32> {
            self.0.borrow().baud_history.clone()
        }

        pub fn dtr_history(&self) -> Vec<bool> {
            self.0.borrow().dtr_history.clone()
        }

        pub fn rts_history(&self) -> Vec<bool> {
            self.0.borrow().rts_history.clone()
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.0.borrow_mut();
            if inner.to_host.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data queued"));
            }
            let mut n = 0;
            while n < buf.len() {
                match inner.to_host.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().from_host.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for FakeLink {
        fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
            self.0.borrow_mut().baud_history.push(baud);
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
            self.0.borrow_mut().dtr_history.push(level);
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> Result<(), Error> {
            self.0.borrow_mut().rts_history.push(level);
            Ok(())
        }

        fn set_read_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
    }
}
