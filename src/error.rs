//! Crate-wide error type.

use thiserror::Error;

/// Everything that can go wrong while talking to an ESP8266 bootloader.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while using serial port: {0}")]
    Serial(#[from] serial::core::Error),

    #[error("failed to open serial port")]
    PortOpen,

    #[error("device did not acknowledge sync after 7 attempts")]
    NotSynced,

    #[error("timed out waiting for a reply")]
    ReadError,

    #[error("received a frame of unexpected size or shape")]
    UnexpectedData,

    #[error("expected a status byte, got {0:02x?}")]
    ExpectedStatusCode(Vec<u8>),

    #[error("expected a 16 byte digest, got {0:02x?}")]
    ExpectedDigest(Vec<u8>),

    #[error("MD5 mismatch: got {got:02x?}, expected {expected:02x?}")]
    DigestMismatch { got: Vec<u8>, expected: Vec<u8> },

    #[error("wrong arguments: {0}")]
    WrongArguments(String),

    #[error("stub reported write failure, status {0}")]
    WriteFailure(u8),

    #[error("stub did not greet with OHAI before timing out")]
    StubNotReady,

    #[error("no stub has been loaded yet")]
    StubNotLoaded,

    #[error("stub expects {expected} parameters, {actual} were provided")]
    StubParamMismatch { expected: usize, actual: usize },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid SLIP escape sequence")]
    InvalidEscape,

    #[error("the ROM reported an error for command {op:#04x}: status {status}")]
    RomError { op: u8, status: u8 },

    #[error("manifest entry refers to a file not present in the bundle: {0}")]
    MissingBundleEntry(String),

    #[error("failed to read bundle archive: {0}")]
    Bundle(#[from] zip::result::ZipError),

    #[error("failed to parse stub descriptor: {0}")]
    StubDescriptor(#[from] serde_json::Error),

    #[error("failed to decode hex in stub descriptor: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Serial(serial::core::Error::from(err))
    }
}
