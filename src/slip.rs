//! SLIP-style byte-stuffed framing used on the serial line.
//!
//! The ROM prints debug text on the wire before it has synced, so the
//! decoder is lenient by default: an escape byte followed by anything
//! other than `0xDC`/`0xDD` is logged and dropped rather than treated as
//! a fatal error. Pass [`SlipDecoder::strict`] to get `InvalidEscape`
//! instead, e.g. for fuzzing or conformance tests.

use crate::error::Error;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode a single frame: `0xC0`, byte-stuffed payload, `0xC0`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    log::trace!("encoded slip frame: {} byte payload -> {} bytes on the wire", payload.len(), out.len());
    out
}

/// Streaming decoder: feed it arbitrary byte chunks, get back whole
/// frames as they close.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    strict: bool,
    in_frame: bool,
    in_escape: bool,
    current: Vec<u8>,
}

impl SlipDecoder {
    /// Lenient decoder: invalid escapes are logged and ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict decoder: an invalid escape aborts decoding with
    /// [`Error::InvalidEscape`].
    pub fn strict() -> Self {
        SlipDecoder {
            strict: true,
            ..Self::default()
        }
    }

    /// Feed a chunk of raw bytes, appending any frames it completes to
    /// `out`. Bytes seen before the opening delimiter of a new frame are
    /// discarded.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        for &byte in chunk {
            if !self.in_frame {
                if byte == END {
                    self.in_frame = true;
                    self.current.clear();
                }
                continue;
            }

            if self.in_escape {
                self.in_escape = false;
                match byte {
                    ESC_END => self.current.push(END),
                    ESC_ESC => self.current.push(ESC),
                    other => {
                        if self.strict {
                            return Err(Error::InvalidEscape);
                        }
                        log::warn!("dropping invalid SLIP escape sequence 0xDB {other:02x}");
                    }
                }
            } else if byte == ESC {
                self.in_escape = true;
            } else if byte == END {
                self.in_frame = false;
                let frame = std::mem::take(&mut self.current);
                log::trace!("decoded slip frame: {} bytes", frame.len());
                out.push(frame);
            } else {
                self.current.push(byte);
            }
        }

        Ok(())
    }
}
