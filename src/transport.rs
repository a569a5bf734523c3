//! Byte-stream abstraction the protocol engine runs on.
//!
//! The session only needs an ordered, reliable stream with a non-blocking
//! peek of pending bytes; RFCOMM sockets and serial ports both qualify.

use std::io;

/// An opened, ordered, bidirectional byte stream.
///
/// `read` blocks up to the transport's own I/O timeout and may return fewer
/// bytes than requested. `bytes_available` must not block.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Number of bytes readable without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)?;
        io::Write::flush(self)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}
