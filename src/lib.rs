//! Rust driver for the Unicorn EEG headset.
//!
//! The headset streams 17-channel samples (8 EEG, 3 accelerometer,
//! 3 gyroscope, battery, counter, validity) at 250 Hz over Bluetooth RFCOMM.
//! This crate turns that raw, unreliable byte stream into physically scaled
//! samples: it frames and checksums commands, resynchronizes on dropped
//! bytes, decodes the fixed 45-byte payload layout and interpolates samples
//! the radio lost, flagging them as invalid.
//!
//! # Timing and synchronization
//!
//! The device does not send timestamps. Its 32-bit running counter
//! increments once per sample at exactly 250 Hz; reconstruct sample times as
//! `start_time + counter / 250`. Interpolated fillers keep the counter
//! series contiguous, so the reconstruction stays valid across radio drops.

mod bluetooth;
mod errors;
mod logging;
mod protocol;
mod transport;
mod unicorn;

pub use bluetooth::{PairedDevice, RfcommStream, UnicornConnector};
pub use errors::{BluetoothError, DriverError, Result};
pub use logging::init_logging;
pub use protocol::{
    build_command, crc16, decode_payload, FrameSync, Sample, ACK, CMD_START_ACQUISITION,
    CMD_STOP_ACQUISITION, FOOTER, FRAME_LEN, HEADER, NUM_ACC_CHANNELS, NUM_CHANNELS,
    NUM_EEG_CHANNELS, NUM_GYR_CHANNELS, SAMPLING_RATE_HZ, SERIAL_PREFIX,
};
pub use transport::Transport;
pub use unicorn::{SampleQueue, SessionState, Unicorn};
