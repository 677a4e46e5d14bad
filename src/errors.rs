use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("checksum mismatch")]
    Checksum,
    #[error("bad packet length {actual} (it should be {expected})")]
    Length { expected: usize, actual: usize },
    #[error("command rejected by device (NAK)")]
    Rejected,
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    #[error("only 4 data channels available at a time")]
    ChannelExhausted,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("voltage out of range: {0}")]
    Range(&'static str),
    #[error("timeout: {0}")]
    Timeout(&'static str),
}

impl DaqError {
    pub(crate) fn validation(field: &'static str, reason: &'static str) -> Self {
        DaqError::Validation { field, reason }
    }
}

pub type Result<T> = std::result::Result<T, DaqError>;
