//! Unicorn wire protocol: command framing, frame synchronization and
//! payload decoding.
//!
//! The headset streams fixed 45-byte frames delimited by a 2-byte header
//! (`C0 00`) and footer (`0D 0A`). Commands going the other way are 3 bytes:
//! the command code followed by a 16-bit checksum of that single byte.
//! Bluetooth delivers the stream in bursts and may drop bytes mid-frame, so
//! decoding runs over an accumulating FIFO that resynchronizes on the header
//! byte.

use std::collections::VecDeque;

use log::debug;

// ============================================================================
// Constants
// ============================================================================

/// Total channels in a decoded sample (EEG + acc + gyr + battery + counter
/// + validity).
pub const NUM_CHANNELS: usize = 17;
/// Device sampling rate. Fixed by the headset firmware.
pub const SAMPLING_RATE_HZ: usize = 250;
pub const NUM_EEG_CHANNELS: usize = 8;
pub const NUM_ACC_CHANNELS: usize = 3;
pub const NUM_GYR_CHANNELS: usize = 3;

/// Serial-number prefix all headsets advertise in their Bluetooth name.
pub const SERIAL_PREFIX: &str = "UN";

/// One wire frame, header and footer included.
pub const FRAME_LEN: usize = 45;
pub const HEADER: [u8; 2] = [0xC0, 0x00];
pub const FOOTER: [u8; 2] = [0x0D, 0x0A];

pub const CMD_START_ACQUISITION: u8 = 0x61;
pub const CMD_STOP_ACQUISITION: u8 = 0x63;
/// Both start and stop are acknowledged with three zero bytes.
pub const ACK: [u8; 3] = [0, 0, 0];

// Fixed payload layout (byte offsets into a frame).
const BATTERY_OFFSET: usize = 2;
const EEG_OFFSET: usize = 3;
const BYTES_PER_EEG_CHANNEL: usize = 3;
const ACC_OFFSET: usize = EEG_OFFSET + NUM_EEG_CHANNELS * BYTES_PER_EEG_CHANNEL;
const BYTES_PER_ACC_CHANNEL: usize = 2;
const GYR_OFFSET: usize = ACC_OFFSET + NUM_ACC_CHANNELS * BYTES_PER_ACC_CHANNEL;
const BYTES_PER_GYR_CHANNEL: usize = 2;
const COUNTER_OFFSET: usize = GYR_OFFSET + NUM_GYR_CHANNELS * BYTES_PER_GYR_CHANNEL;

// Physical scaling. EEG is a 24-bit ADC reading in microvolts, acc in g,
// gyr in deg/s, battery a 4-bit level mapped onto a 3.0-4.2 V range.
const EEG_SCALE: f32 = 4_500_000.0 / 50_331_642.0;
const ACC_SCALE: f32 = 1.0 / 4096.0;
const GYR_SCALE: f32 = 1.0 / 32.8;
const BATTERY_BIT_MASK: u8 = 0x0F;
const BATTERY_SCALE: f32 = 1.2 / 16.0;
const BATTERY_VOLTAGE_OFFSET: f32 = 3.0;
const BATTERY_PERCENT_FACTOR: f32 = 100.0 / 4.2;

// ============================================================================
// Command codec
// ============================================================================

/// Checksum used by the headset for command frames.
///
/// This is a byte-swapping CRC-16 variant, not CRC-16/CCITT; the exact
/// update sequence below is what the firmware implements and must be
/// reproduced bit for bit.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc >> 8) | (crc << 8);
        crc ^= byte as u16;
        crc ^= (crc & 0xFF) >> 4;
        crc ^= (crc << 8) << 4;
        crc ^= ((crc & 0xFF) << 4) << 1;
    }
    crc
}

/// Build an outgoing command frame: `[cmd, crc_high, crc_low]`.
pub fn build_command(cmd: u8) -> [u8; 3] {
    let crc = crc16(&[cmd]);
    [cmd, (crc >> 8) as u8, crc as u8]
}

// ============================================================================
// Sample
// ============================================================================

/// One decoded, physically scaled multichannel reading.
///
/// `valid` is false for samples synthesized to fill a counter gap and true
/// for samples actually decoded from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// EEG channels in microvolts.
    pub eeg: [f32; NUM_EEG_CHANNELS],
    /// Accelerometer channels in g.
    pub acc: [f32; NUM_ACC_CHANNELS],
    /// Gyroscope channels in deg/s.
    pub gyr: [f32; NUM_GYR_CHANNELS],
    /// Battery charge in percent.
    pub battery_percent: f32,
    /// Device's running sample index. Increments by one per sample at
    /// 250 Hz and wraps at 32 bits.
    pub counter: u32,
    pub valid: bool,
}

impl Sample {
    /// Flatten into the channel order the device API exposes:
    /// EEG0..7, Acc0..2, Gyr0..2, battery, counter, validity.
    pub fn to_channels(&self) -> [f32; NUM_CHANNELS] {
        let mut out = [0.0; NUM_CHANNELS];
        out[..NUM_EEG_CHANNELS].copy_from_slice(&self.eeg);
        out[NUM_EEG_CHANNELS..NUM_EEG_CHANNELS + NUM_ACC_CHANNELS].copy_from_slice(&self.acc);
        let gyr_at = NUM_EEG_CHANNELS + NUM_ACC_CHANNELS;
        out[gyr_at..gyr_at + NUM_GYR_CHANNELS].copy_from_slice(&self.gyr);
        out[NUM_CHANNELS - 3] = self.battery_percent;
        out[NUM_CHANNELS - 2] = self.counter as f32;
        out[NUM_CHANNELS - 1] = if self.valid { 1.0 } else { 0.0 };
        out
    }
}

/// Decode one validated 45-byte frame into a physically scaled sample.
///
/// The caller owns the validity flag; decoded samples leave it false until
/// the session marks them genuine.
pub fn decode_payload(raw: &[u8; FRAME_LEN]) -> Sample {
    let mut sample = Sample::default();

    for (i, ch) in sample.eeg.iter_mut().enumerate() {
        let o = EEG_OFFSET + i * BYTES_PER_EEG_CHANNEL;
        // 24-bit big-endian two's complement, sign-extended through i32.
        let v = ((raw[o] as i32) << 16) | ((raw[o + 1] as i32) << 8) | raw[o + 2] as i32;
        let v = (v << 8) >> 8;
        *ch = v as f32 * EEG_SCALE;
    }

    for (i, ch) in sample.acc.iter_mut().enumerate() {
        let o = ACC_OFFSET + i * BYTES_PER_ACC_CHANNEL;
        *ch = i16::from_le_bytes([raw[o], raw[o + 1]]) as f32 * ACC_SCALE;
    }

    for (i, ch) in sample.gyr.iter_mut().enumerate() {
        let o = GYR_OFFSET + i * BYTES_PER_GYR_CHANNEL;
        *ch = i16::from_le_bytes([raw[o], raw[o + 1]]) as f32 * GYR_SCALE;
    }

    let level = raw[BATTERY_OFFSET] & BATTERY_BIT_MASK;
    sample.battery_percent =
        (level as f32 * BATTERY_SCALE + BATTERY_VOLTAGE_OFFSET) * BATTERY_PERCENT_FACTOR;

    sample.counter = u32::from_le_bytes([
        raw[COUNTER_OFFSET],
        raw[COUNTER_OFFSET + 1],
        raw[COUNTER_OFFSET + 2],
        raw[COUNTER_OFFSET + 3],
    ]);

    sample
}

// ============================================================================
// Frame synchronizer
// ============================================================================

/// Locates valid frames inside the accumulating raw byte stream.
///
/// Drop-and-resync design: leading noise is discarded up to the next header
/// byte, then a full 45-byte candidate is popped and checked against header
/// and footer. A candidate that fails the check is dropped whole rather than
/// re-scanned byte by byte; worst case that loses one extra frame, which the
/// counter-gap interpolation upstream papers over.
#[derive(Debug, Default)]
pub struct FrameSync {
    fifo: VecDeque<u8>,
}

impl FrameSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes to the FIFO.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.fifo.extend(bytes.iter().copied());
    }

    pub fn buffered(&self) -> usize {
        self.fifo.len()
    }

    pub fn clear(&mut self) {
        self.fifo.clear();
    }

    /// Pop the next validated frame, or `None` until enough bytes arrive.
    ///
    /// Call in a loop to drain every complete frame currently buffered.
    pub fn next_frame(&mut self) -> Option<[u8; FRAME_LEN]> {
        while self.fifo.len() >= FRAME_LEN {
            // Discard noise until a header byte reaches the front.
            while let Some(&byte) = self.fifo.front() {
                if byte == HEADER[0] {
                    break;
                }
                self.fifo.pop_front();
            }

            if self.fifo.front() != Some(&HEADER[0]) || self.fifo.len() < FRAME_LEN {
                return None;
            }

            let mut frame = [0u8; FRAME_LEN];
            for slot in frame.iter_mut() {
                if let Some(byte) = self.fifo.pop_front() {
                    *slot = byte;
                }
            }

            if frame[..2] == HEADER && frame[FRAME_LEN - 2..] == FOOTER {
                return Some(frame);
            }
            debug!("dropping candidate frame with invalid header/footer");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_frame(counter: u32) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..2].copy_from_slice(&HEADER);
        frame[COUNTER_OFFSET..COUNTER_OFFSET + 4].copy_from_slice(&counter.to_le_bytes());
        frame[FRAME_LEN - 2..].copy_from_slice(&FOOTER);
        frame
    }

    #[test]
    fn crc_command_vectors_are_stable() {
        assert_eq!(build_command(CMD_START_ACQUISITION), [0x61, 0x7C, 0x87]);
        assert_eq!(build_command(CMD_STOP_ACQUISITION), [0x63, 0x5C, 0xC5]);
        // Determinism: same input, same checksum.
        assert_eq!(crc16(&[0x61]), crc16(&[0x61]));
    }

    #[test]
    fn frame_sync_accepts_single_valid_frame() {
        let mut sync = FrameSync::new();
        sync.extend(&valid_frame(7));
        let frame = sync.next_frame().expect("one frame buffered");
        assert_eq!(frame[..2], HEADER);
        assert_eq!(frame[FRAME_LEN - 2..], FOOTER);
        assert!(sync.next_frame().is_none());
    }

    #[test]
    fn frame_sync_skips_leading_garbage() {
        let mut sync = FrameSync::new();
        sync.extend(&[0x11, 0x22, 0x33, 0x44]);
        sync.extend(&valid_frame(1));
        assert!(sync.next_frame().is_some());
        assert_eq!(sync.buffered(), 0);
    }

    #[test]
    fn frame_sync_drops_candidate_with_bad_footer() {
        let mut frame = valid_frame(1);
        frame[FRAME_LEN - 1] = 0x00;
        let mut sync = FrameSync::new();
        sync.extend(&frame);
        assert!(sync.next_frame().is_none());
        // The bad candidate is consumed, not left to jam the stream.
        sync.extend(&valid_frame(2));
        assert!(sync.next_frame().is_some());
    }

    #[test]
    fn frame_sync_waits_for_partial_frame() {
        let mut sync = FrameSync::new();
        let frame = valid_frame(3);
        sync.extend(&frame[..20]);
        assert!(sync.next_frame().is_none());
        sync.extend(&frame[20..]);
        assert!(sync.next_frame().is_some());
    }

    #[test]
    fn frame_sync_drains_back_to_back_frames() {
        let mut sync = FrameSync::new();
        sync.extend(&valid_frame(1));
        sync.extend(&[0xAA, 0xBB]);
        sync.extend(&valid_frame(2));
        assert!(sync.next_frame().is_some());
        assert!(sync.next_frame().is_some());
        assert!(sync.next_frame().is_none());
    }

    #[test]
    fn decode_scales_eeg_unit_value() {
        let mut frame = valid_frame(0);
        // EEG channel 0 = 0x000001, the smallest positive reading.
        frame[EEG_OFFSET + 2] = 0x01;
        let sample = decode_payload(&frame);
        assert!((sample.eeg[0] - EEG_SCALE).abs() < 1e-9);
    }

    #[test]
    fn decode_sign_extends_negative_eeg() {
        let mut frame = valid_frame(0);
        // EEG channel 1 = 0xFFFFFF == -1.
        let o = EEG_OFFSET + BYTES_PER_EEG_CHANNEL;
        frame[o..o + 3].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        let sample = decode_payload(&frame);
        assert!((sample.eeg[1] + EEG_SCALE).abs() < 1e-9);
    }

    #[test]
    fn decode_scales_motion_channels() {
        let mut frame = valid_frame(0);
        frame[ACC_OFFSET..ACC_OFFSET + 2].copy_from_slice(&1i16.to_le_bytes());
        let o = ACC_OFFSET + BYTES_PER_ACC_CHANNEL;
        frame[o..o + 2].copy_from_slice(&(-4096i16).to_le_bytes());
        frame[GYR_OFFSET..GYR_OFFSET + 2].copy_from_slice(&328i16.to_le_bytes());
        let sample = decode_payload(&frame);
        assert!((sample.acc[0] - 1.0 / 4096.0).abs() < 1e-9);
        assert!((sample.acc[1] + 1.0).abs() < 1e-6);
        assert!((sample.gyr[0] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn decode_battery_from_low_nibble() {
        let mut frame = valid_frame(0);
        // High nibble must be ignored.
        frame[BATTERY_OFFSET] = 0xF0 | 0x0F;
        let sample = decode_payload(&frame);
        let expected = (15.0 * (1.2 / 16.0) + 3.0) * (100.0 / 4.2);
        assert!((sample.battery_percent - expected).abs() < 1e-4);
    }

    #[test]
    fn decode_reads_little_endian_counter() {
        let frame = valid_frame(0x0102_0304);
        assert_eq!(decode_payload(&frame).counter, 0x0102_0304);
    }

    #[test]
    fn channel_flattening_order() {
        let mut sample = Sample {
            battery_percent: 85.0,
            counter: 42,
            valid: true,
            ..Sample::default()
        };
        sample.eeg[0] = 1.5;
        sample.acc[2] = -0.5;
        sample.gyr[0] = 3.25;
        let out = sample.to_channels();
        assert_eq!(out[0], 1.5);
        assert_eq!(out[10], -0.5);
        assert_eq!(out[11], 3.25);
        assert_eq!(out[14], 85.0);
        assert_eq!(out[15], 42.0);
        assert_eq!(out[16], 1.0);
    }
}
