use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no usable bluetooth adapter: {0}")]
    AdapterUnavailable(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("incomplete read: expected {expected} bytes, got {actual}")]
    IncompleteRead { expected: usize, actual: usize },
    #[error("invalid acknowledge: {0:02X?}")]
    AckMismatch(Vec<u8>),
    #[error("no acknowledge within {0:?}")]
    AckTimeout(Duration),
    #[error("start data acquisition first")]
    AcquisitionNotStarted,
    #[error("no sample assembled within {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found among paired devices: {serial}")]
    NotFound { serial: String },
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
