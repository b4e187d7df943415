use std::io;

use thiserror::Error;

/// Catch-all error type for the ctrsd library
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported header version")]
    UnsupportedVersion,
    #[error("Data out of range")]
    OutOfRange,
    #[error("Missing region")]
    MissingRegion,
    #[error("Missing key for slot {0:#04x}")]
    MissingKey(usize),
    #[error("Signature corrupted/forged")]
    SignatureCorrupted,
    #[error("Hash mismatch")]
    HashMismatch,
    #[error("Operation aborted")]
    Aborted,
    #[error("Unsupported {0}")]
    Unsupported(&'static str),
    #[error("Invalid length of {what}: {actual} (expected {expected})")]
    InvalidLength {
        what: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("Failed to decode hex string")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, Error>;
