//! Unicorn headset session: connection lifecycle, acquisition state machine
//! and the blocking sample-retrieval call.
//!
//! The headset streams at a fixed 250 Hz once acquisition starts. Bluetooth
//! delivers the stream in bursts, may drop bytes mid-frame and may lose whole
//! frames; the session reassembles frames from a raw byte FIFO, detects lost
//! samples through the device's running counter and synthesizes marked filler
//! samples so the consumer sees a continuous 250 Hz series.
//!
//! # Threading
//!
//! A session is a single-consumer resource. All methods take `&mut self`;
//! the intended pattern is one worker thread that owns the `Unicorn` and
//! loops on [`Unicorn::get_data`] while a shared running flag is set. Since
//! `get_data` returns within one second, clearing the flag stops the worker
//! promptly without forced cancellation.

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::protocol::{
    build_command, decode_payload, FrameSync, Sample, ACK, CMD_START_ACQUISITION,
    CMD_STOP_ACQUISITION, SAMPLING_RATE_HZ,
};
use crate::bluetooth::RfcommStream;
use crate::transport::Transport;

/// Serial baud rate when talking through a bound `/dev/rfcommN` port.
const BAUD_RATE: u32 = 115_200;

/// Serial read timeout; RFCOMM sockets carry their own SO_RCVTIMEO instead.
const SERIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The device stalls if nothing is written for a while; a dummy byte at most
/// once per second keeps the stream flowing.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(1000);

/// Upper bound on assembling one sample in `get_data`.
const ACQUISITION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound on the stop-command ack scan. The ack is interleaved with
/// still-streaming frames, so it needs room for a few frame lengths.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded-sample backlog target, in seconds of data.
const BUFFER_SECONDS: usize = 10;

/// Bounded queue size: ten seconds of samples.
const QUEUE_CAPACITY: usize = SAMPLING_RATE_HZ * BUFFER_SECONDS;

/// Largest counter gap that still gets interpolated. An apparent gap beyond
/// one queue's worth of samples means a counter rollback or desync, not
/// ordinary frame loss, and synthesizing it would flood the queue.
const MAX_INTERPOLATED_GAP: u32 = QUEUE_CAPACITY as u32;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, device idle.
    Connected,
    /// Device streaming frames.
    Acquiring,
    /// Transport released; the session is inert.
    Closed,
}

/// Number of samples lost between two genuine counter values.
///
/// Computed modulo 2^32 so a gap spanning the counter wrap still counts.
/// A stall or rollback shows up as an apparent gap near 2^32 and yields
/// zero, as does anything past the interpolation cap.
fn missing_samples(prev: u32, next: u32) -> u32 {
    let gap = next.wrapping_sub(prev).wrapping_sub(1);
    if gap <= MAX_INTERPOLATED_GAP {
        gap
    } else {
        0
    }
}

// ============================================================================
// Sample queue
// ============================================================================

/// Bounded FIFO of decoded samples bridging the receive pipeline and the
/// consumer.
///
/// When the consumer stalls and the queue fills, the oldest samples are
/// dropped so the backlog stays at most [`BUFFER_SECONDS`] behind live data.
#[derive(Debug)]
pub struct SampleQueue {
    samples: VecDeque<Sample>,
    capacity: usize,
    dropped: u64,
}

impl SampleQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % self.capacity as u64 == 0 {
                warn!(
                    "sample queue full (capacity {}), {} oldest samples dropped so far",
                    self.capacity, self.dropped
                );
            }
        }
        self.samples.push_back(sample);
    }

    pub fn pop(&mut self) -> Option<Sample> {
        self.samples.pop_front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples discarded because the consumer fell more than the queue
    /// capacity behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ============================================================================
// Session
// ============================================================================

/// One connected Unicorn headset.
///
/// # Example
/// ```ignore
/// let connector = UnicornConnector::default();
/// let devices = connector.list_paired()?;
/// let stream = connector.connect(&devices[0])?;
/// let mut device = Unicorn::from_rfcomm(stream);
///
/// device.start_acquisition()?;
/// let sample = device.get_data()?;
/// println!("counter={} eeg0={:.2}uV", sample.counter, sample.eeg[0]);
/// device.stop_acquisition()?;
/// device.close();
/// ```
pub struct Unicorn {
    transport: Option<Box<dyn Transport>>,
    state: SessionState,
    frame_sync: FrameSync,
    queue: SampleQueue,
    /// Last genuine sample, the template for gap interpolation.
    prev: Sample,
    last_keep_alive: Option<Instant>,
    stop_ack_timeout: Duration,
}

impl Unicorn {
    /// Wrap an already-opened transport in a session.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            state: SessionState::Connected,
            frame_sync: FrameSync::new(),
            queue: SampleQueue::with_capacity(QUEUE_CAPACITY),
            prev: Sample::default(),
            last_keep_alive: None,
            stop_ack_timeout: STOP_ACK_TIMEOUT,
        }
    }

    /// Wrap a connected RFCOMM stream, the usual path after
    /// `UnicornConnector::connect`.
    pub fn from_rfcomm(stream: RfcommStream) -> Self {
        Self::from_transport(Box::new(stream))
    }

    /// Connect through a serial port (e.g. `/dev/rfcomm0` after a manual
    /// `rfcomm bind`).
    pub fn connect_serial(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        Ok(Self::from_transport(Box::new(port)))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(DriverError::Closed)
    }

    /// Send the start command and require the exact 3-byte ack.
    ///
    /// A short read fails with `IncompleteRead`, wrong bytes with
    /// `AckMismatch`; in either case the session stays out of acquisition.
    pub fn start_acquisition(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(DriverError::Closed);
        }
        let message = build_command(CMD_START_ACQUISITION);
        let transport = self.transport_mut()?;
        transport.write_all(&message)?;

        let mut ack = [0u8; ACK.len()];
        let n = transport.read(&mut ack)?;
        if n != ACK.len() {
            return Err(DriverError::IncompleteRead {
                expected: ACK.len(),
                actual: n,
            });
        }
        if ack != ACK {
            return Err(DriverError::AckMismatch(ack.to_vec()));
        }

        self.state = SessionState::Acquiring;
        debug!("acquisition started");
        Ok(())
    }

    /// Send the stop command and scan for its ack.
    ///
    /// The device keeps streaming frames until it processes the command, so
    /// the ack bytes can appear anywhere in the stream. A rolling 3-position
    /// cursor advances on matching bytes and resets on any mismatch, bounded
    /// by an overall deadline.
    pub fn stop_acquisition(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(DriverError::Closed);
        }
        let timeout = self.stop_ack_timeout;
        let message = build_command(CMD_STOP_ACQUISITION);
        let transport = self.transport_mut()?;
        transport.write_all(&message)?;

        let deadline = Instant::now() + timeout;
        let mut matched = 0;
        let mut byte = [0u8; 1];
        while matched < ACK.len() {
            if Instant::now() >= deadline {
                return Err(DriverError::AckTimeout(timeout));
            }
            match transport.read(&mut byte) {
                Ok(0) => {
                    return Err(DriverError::IncompleteRead {
                        expected: 1,
                        actual: 0,
                    })
                }
                Ok(_) => {
                    if byte[0] == ACK[matched] {
                        matched += 1;
                    } else {
                        matched = 0;
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.state = SessionState::Connected;
        debug!("acquisition stopped");
        Ok(())
    }

    /// Block until the next sample is available, up to one second.
    ///
    /// Runs the receive pipeline (byte pump, frame sync, decode, gap
    /// interpolation) until the queue holds a sample, then pops the oldest.
    /// Interpolated fillers come out strictly before the genuine sample that
    /// revealed the gap. Any transport failure here should be treated as
    /// fatal to the session.
    pub fn get_data(&mut self) -> Result<Sample> {
        match self.state {
            SessionState::Closed => return Err(DriverError::Closed),
            SessionState::Connected => return Err(DriverError::AcquisitionNotStarted),
            SessionState::Acquiring => {}
        }

        // Keep-alive: the device stalls on an otherwise idle link.
        let due = self
            .last_keep_alive
            .map_or(true, |t| t.elapsed() > KEEP_ALIVE_INTERVAL);
        if due {
            self.last_keep_alive = Some(Instant::now());
            self.transport_mut()?.write_all(&[0u8])?;
        }

        let deadline = Instant::now() + ACQUISITION_TIMEOUT;
        while self.queue.is_empty() {
            self.pump()?;
            if self.queue.is_empty() {
                if Instant::now() >= deadline {
                    return Err(DriverError::AcquisitionTimeout(ACQUISITION_TIMEOUT));
                }
                thread::sleep(Duration::from_millis(1));
            }
        }

        match self.queue.pop() {
            Some(sample) => Ok(sample),
            None => Err(DriverError::AcquisitionTimeout(ACQUISITION_TIMEOUT)),
        }
    }

    /// Pull whatever the transport has buffered and drain complete frames
    /// into the sample queue.
    fn pump(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(DriverError::Closed)?;
        let available = transport.bytes_available()?;
        if available > 0 {
            let mut buf = vec![0u8; available];
            let n = transport.read(&mut buf)?;
            self.frame_sync.extend(&buf[..n]);
        }

        while let Some(frame) = self.frame_sync.next_frame() {
            let mut sample = decode_payload(&frame);

            let missing = missing_samples(self.prev.counter, sample.counter);
            if missing > 0 {
                warn!(
                    "interpolating {missing} lost samples before counter {}",
                    sample.counter
                );
                for i in 1..=missing {
                    let mut filler = self.prev.clone();
                    filler.counter = self.prev.counter.wrapping_add(i);
                    filler.valid = false;
                    self.queue.push(filler);
                }
            }

            sample.valid = true;
            self.prev = sample.clone();
            self.queue.push(sample);
        }
        Ok(())
    }

    /// Release the transport and buffers. Idempotent; every subsequent
    /// transport-touching call fails with `Closed`.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("transport released");
        }
        self.frame_sync.clear();
        self.queue.clear();
        self.state = SessionState::Closed;
    }

    #[cfg(test)]
    fn set_stop_ack_timeout(&mut self, timeout: Duration) {
        self.stop_ack_timeout = timeout;
    }
}

impl Drop for Unicorn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::{FOOTER, FRAME_LEN, HEADER};

    #[derive(Default)]
    struct MockState {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        block_when_empty: bool,
    }

    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<MockState>>);

    impl MockTransport {
        fn push_incoming(&self, bytes: &[u8]) {
            self.0.lock().unwrap().incoming.extend(bytes.iter().copied());
        }

        fn block_when_empty(&self) {
            self.0.lock().unwrap().block_when_empty = true;
        }

        fn written(&self) -> Vec<u8> {
            self.0.lock().unwrap().written.clone()
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.lock().unwrap();
            if state.incoming.is_empty() {
                if state.block_when_empty {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                return Ok(0);
            }
            let n = buf.len().min(state.incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.incoming.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().written.extend_from_slice(buf);
            Ok(())
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.0.lock().unwrap().incoming.len())
        }
    }

    fn frame_with_counter(counter: u32) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..2].copy_from_slice(&HEADER);
        frame[39..43].copy_from_slice(&counter.to_le_bytes());
        frame[FRAME_LEN - 2..].copy_from_slice(&FOOTER);
        frame
    }

    fn acquiring_session() -> (Unicorn, MockTransport) {
        let mock = MockTransport::default();
        mock.push_incoming(&ACK);
        let mut device = Unicorn::from_transport(Box::new(mock.clone()));
        device.start_acquisition().unwrap();
        (device, mock)
    }

    #[test]
    fn missing_samples_gap_math() {
        assert_eq!(missing_samples(5, 9), 3);
        assert_eq!(missing_samples(5, 6), 0);
        // Stall and rollback synthesize nothing.
        assert_eq!(missing_samples(5, 5), 0);
        assert_eq!(missing_samples(5, 4), 0);
        // Gap across the 32-bit wrap still counts.
        assert_eq!(missing_samples(u32::MAX, 2), 2);
        // Absurd jumps are treated as desync, not loss.
        assert_eq!(missing_samples(0, MAX_INTERPOLATED_GAP + 2), 0);
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = SampleQueue::with_capacity(8);
        for counter in 0..5 {
            queue.push(Sample {
                counter,
                ..Sample::default()
            });
        }
        for counter in 0..5 {
            assert_eq!(queue.pop().unwrap().counter, counter);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let mut queue = SampleQueue::with_capacity(3);
        for counter in 0..5 {
            queue.push(Sample {
                counter,
                ..Sample::default()
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop().unwrap().counter, 2);
    }

    #[test]
    fn start_requires_exact_ack() {
        let mock = MockTransport::default();
        mock.push_incoming(&ACK);
        let mut device = Unicorn::from_transport(Box::new(mock.clone()));
        device.start_acquisition().unwrap();
        assert_eq!(device.state(), SessionState::Acquiring);
        assert_eq!(mock.written(), vec![0x61, 0x7C, 0x87]);
    }

    #[test]
    fn start_fails_on_short_read() {
        let mock = MockTransport::default();
        mock.push_incoming(&[0, 0]);
        let mut device = Unicorn::from_transport(Box::new(mock));
        match device.start_acquisition() {
            Err(DriverError::IncompleteRead {
                expected: 3,
                actual: 2,
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(device.state(), SessionState::Connected);
    }

    #[test]
    fn start_fails_on_wrong_ack() {
        let mock = MockTransport::default();
        mock.push_incoming(&[0, 1, 0]);
        let mut device = Unicorn::from_transport(Box::new(mock));
        assert!(matches!(
            device.start_acquisition(),
            Err(DriverError::AckMismatch(_))
        ));
    }

    #[test]
    fn get_data_requires_acquiring() {
        let mut device = Unicorn::from_transport(Box::new(MockTransport::default()));
        assert!(matches!(
            device.get_data(),
            Err(DriverError::AcquisitionNotStarted)
        ));
    }

    #[test]
    fn get_data_decodes_one_frame_and_sends_keep_alive() {
        let (mut device, mock) = acquiring_session();
        mock.push_incoming(&frame_with_counter(1));
        let sample = device.get_data().unwrap();
        assert!(sample.valid);
        assert_eq!(sample.counter, 1);
        // Keep-alive dummy byte follows the start command bytes.
        assert_eq!(mock.written(), vec![0x61, 0x7C, 0x87, 0x00]);
    }

    #[test]
    fn gap_yields_interpolated_fillers_before_genuine_sample() {
        let (mut device, mock) = acquiring_session();
        let mut first = frame_with_counter(1);
        // Give the genuine samples a recognizable accelerometer value.
        first[27..29].copy_from_slice(&4096i16.to_le_bytes());
        mock.push_incoming(&first);
        let genuine = device.get_data().unwrap();
        assert_eq!((genuine.counter, genuine.valid), (1, true));

        mock.push_incoming(&frame_with_counter(5));
        for expected in 2..5 {
            let filler = device.get_data().unwrap();
            assert_eq!((filler.counter, filler.valid), (expected, false));
            // Fillers copy the previous genuine channels.
            assert!((filler.acc[0] - 1.0).abs() < 1e-6);
        }
        let next = device.get_data().unwrap();
        assert_eq!((next.counter, next.valid), (5, true));
    }

    #[test]
    fn counter_rollback_is_not_interpolated() {
        let (mut device, mock) = acquiring_session();
        mock.push_incoming(&frame_with_counter(5));
        assert_eq!(device.get_data().unwrap().counter, 5);
        mock.push_incoming(&frame_with_counter(4));
        let sample = device.get_data().unwrap();
        assert_eq!((sample.counter, sample.valid), (4, true));
    }

    #[test]
    fn garbage_between_frames_is_resynced() {
        let (mut device, mock) = acquiring_session();
        mock.push_incoming(&[0x55, 0xAA, 0x13]);
        mock.push_incoming(&frame_with_counter(1));
        assert_eq!(device.get_data().unwrap().counter, 1);
    }

    #[test]
    fn get_data_times_out_without_frames() {
        let (mut device, _mock) = acquiring_session();
        let start = Instant::now();
        assert!(matches!(
            device.get_data(),
            Err(DriverError::AcquisitionTimeout(_))
        ));
        assert!(start.elapsed() >= ACQUISITION_TIMEOUT);
    }

    #[test]
    fn stop_ack_is_found_inside_the_stream() {
        let (mut device, mock) = acquiring_session();
        // Partial matches reset the cursor; the run must be contiguous.
        mock.push_incoming(&[0x01, 0x00, 0x00, 0x7F, 0x00, 0x00, 0x00]);
        device.stop_acquisition().unwrap();
        assert_eq!(device.state(), SessionState::Connected);
        let written = mock.written();
        assert_eq!(&written[written.len() - 3..], &[0x63, 0x5C, 0xC5]);
    }

    #[test]
    fn stop_times_out_without_ack() {
        let (mut device, mock) = acquiring_session();
        mock.block_when_empty();
        device.set_stop_ack_timeout(Duration::from_millis(20));
        assert!(matches!(
            device.stop_acquisition(),
            Err(DriverError::AckTimeout(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_fails_later_calls() {
        let (mut device, _mock) = acquiring_session();
        device.close();
        device.close();
        assert_eq!(device.state(), SessionState::Closed);
        assert!(matches!(device.get_data(), Err(DriverError::Closed)));
        assert!(matches!(
            device.start_acquisition(),
            Err(DriverError::Closed)
        ));
        assert!(matches!(
            device.stop_acquisition(),
            Err(DriverError::Closed)
        ));
    }
}
