//! Device enumeration, bonding and the RFCOMM byte stream.
//!
//! Behavior depends on build features:
//! - With the `bluez` feature (default): already-bonded headsets are listed
//!   by name, bonding is driven through BlueZ when needed, and the RFCOMM
//!   socket is opened via `bluer`.
//! - Without it: the caller supplies the MAC of an already-paired headset
//!   and a raw RFCOMM socket is opened through libc only.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

#[cfg(feature = "bluez")]
use bluer::agent::{Agent, RequestConfirmationFn};
#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{Adapter, Address, Session};
use log::{debug, info};
#[cfg(feature = "bluez")]
use tokio::runtime::Runtime;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::protocol::SERIAL_PREFIX;
use crate::transport::Transport;

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_ushort = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

/// SPP channel the headset listens on.
const RFCOMM_CHANNEL: u8 = 1;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
/// Bonding must complete within this window or the connect attempt fails.
const PAIR_TIMEOUT_SECS: u64 = 10;

/// An already-bonded headset, as returned by enumeration.
///
/// Owned by the caller and passed back into `connect`; the connector keeps
/// no device cache of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    /// Advertised Bluetooth name, e.g. `UN-2021.02.47`.
    pub name: String,
    /// MAC address in colon-separated form.
    pub address: String,
}

/// Opens RFCOMM streams to Unicorn headsets.
///
/// One connect call makes exactly one attempt; retry policy belongs to the
/// caller.
#[derive(Debug, Clone)]
pub struct UnicornConnector {
    pub channel: u8,
    pub io_timeout: Duration,
    pub pair_timeout: Duration,
}

impl Default for UnicornConnector {
    fn default() -> Self {
        Self {
            channel: RFCOMM_CHANNEL,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            pair_timeout: Duration::from_secs(PAIR_TIMEOUT_SECS),
        }
    }
}

#[cfg(feature = "bluez")]
impl UnicornConnector {
    /// List bonded devices whose name carries the headset serial prefix.
    pub fn list_paired(&self) -> Result<Vec<PairedDevice>> {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let adapter = default_adapter().await?;
            let mut devices = Vec::new();
            let addresses = adapter
                .device_addresses()
                .await
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;
            for address in addresses {
                let device = adapter
                    .device(address)
                    .map_err(|e| BluetoothError::Connection(e.to_string()))?;
                if !device.is_paired().await.unwrap_or(false) {
                    continue;
                }
                let Some(name) = device.name().await.unwrap_or(None) else {
                    continue;
                };
                if name.contains(SERIAL_PREFIX) {
                    devices.push(PairedDevice {
                        name,
                        address: address.to_string(),
                    });
                }
            }
            debug!("found {} paired headsets", devices.len());
            Ok(devices)
        })
    }

    /// Bond (if needed) and open an RFCOMM stream to the given headset.
    pub fn connect(&self, device: &PairedDevice) -> Result<RfcommStream> {
        let rt = Runtime::new()?;
        rt.block_on(self.connect_async(device))
    }

    async fn connect_async(&self, paired: &PairedDevice) -> Result<RfcommStream> {
        let session = Session::new()
            .await
            .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;

        let address: Address = paired.address.parse().map_err(|_| {
            DriverError::Bluetooth(BluetoothError::Connection("invalid mac".into()))
        })?;
        let device = adapter.device(address).map_err(|_| {
            DriverError::Bluetooth(BluetoothError::NotFound {
                serial: paired.name.clone(),
            })
        })?;

        // Just-works bonding; the headset has no PIN.
        let agent_handle = session
            .register_agent(accept_all_agent())
            .await
            .map_err(|e| DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))?;

        if !device.is_paired().await.unwrap_or(false) {
            info!("bonding headset: serial={}", paired.name);
            tokio::time::timeout(self.pair_timeout, device.pair())
                .await
                .map_err(|_| DriverError::ConnectionTimeout(self.pair_timeout))
                .and_then(|r| {
                    r.map_err(|e| DriverError::Bluetooth(BluetoothError::Pairing(e.to_string())))
                })?;
        }
        let _ = device.set_trusted(true).await;
        drop(agent_handle);

        let stream = open_rfcomm(address, self.channel, self.io_timeout).await?;
        stream.verify_connected()?;
        info!(
            "RFCOMM connection established: serial={}, mac={}",
            paired.name, paired.address
        );
        Ok(stream)
    }
}

#[cfg(not(feature = "bluez"))]
impl UnicornConnector {
    /// Open a raw RFCOMM socket to an already-paired headset. Bonding must
    /// have been done ahead of time (e.g. via `bluetoothctl`).
    pub fn connect(&self, device: &PairedDevice) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(&device.address)?;
        let stream = open_rfcomm_raw(bdaddr, self.channel, self.io_timeout)?;
        stream.verify_connected()?;
        info!(
            "RFCOMM connection established (manual mode): mac={}",
            device.address
        );
        Ok(stream)
    }
}

#[cfg(feature = "bluez")]
async fn default_adapter() -> Result<Adapter> {
    let session = Session::new()
        .await
        .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;
    let adapter = session
        .default_adapter()
        .await
        .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;
    adapter
        .set_powered(true)
        .await
        .map_err(|e| DriverError::AdapterUnavailable(e.to_string()))?;
    Ok(adapter)
}

#[cfg(feature = "bluez")]
fn accept_all_agent() -> Agent {
    let confirm_fn: RequestConfirmationFn = Box::new(|_req| Box::pin(async { Ok(()) }));
    Agent {
        request_default: true,
        request_confirmation: Some(confirm_fn),
        ..Default::default()
    }
}

/// Blocking RFCOMM stream with socket-level I/O timeouts.
pub struct RfcommStream {
    file: File,
    #[allow(dead_code)]
    read_timeout: Duration,
}

impl RfcommStream {
    /// Verify the socket carries no pending error before handing it to the
    /// session.
    pub fn verify_connected(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                self.file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(DriverError::Io(io::Error::last_os_error()));
        }
        if err != 0 {
            return Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RfcommStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Transport for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.flush()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut pending: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::FIONREAD, &mut pending) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pending as usize)
    }
}

/// Apply CLOEXEC, clear O_NONBLOCK and set send/receive timeouts so the
/// socket behaves like a plain blocking `File`.
fn configure_blocking_fd(fd: RawFd, timeout: Duration) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(address: Address, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!("opening RFCOMM socket: mac={}, channel={}", address, channel);

    let target = SocketAddr::new(address, channel);
    let stream = tokio::time::timeout(timeout, Stream::connect(target))
        .await
        .map_err(|_| DriverError::ConnectionTimeout(timeout))
        .and_then(|r| {
            r.map_err(|e| DriverError::Bluetooth(BluetoothError::Connection(e.to_string())))
        })?;

    // Duplicate the fd to own it separately from the async stream, then make
    // it blocking so the session can read it like a file.
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            io::Error::last_os_error().to_string(),
        )));
    }
    if let Err(e) = configure_blocking_fd(fd, timeout) {
        unsafe {
            libc::close(fd);
        }
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            e.to_string(),
        )));
    }

    Ok(RfcommStream {
        file: unsafe { File::from_raw_fd(fd) },
        read_timeout: timeout,
    })
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Copy, Clone)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

#[cfg(not(feature = "bluez"))]
fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            "invalid mac".into(),
        )));
    }

    // bdaddr_t stores bytes in reverse order compared to the MAC string.
    let mut addr = BdAddr { b: [0; 6] };
    for (i, part) in parts.iter().enumerate() {
        addr.b[5 - i] = u8::from_str_radix(part, 16).map_err(|_| {
            DriverError::Bluetooth(BluetoothError::Connection("invalid mac".into()))
        })?;
    }
    Ok(addr)
}

#[cfg(not(feature = "bluez"))]
fn open_rfcomm_raw(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket (manual): channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH as libc::c_int,
            libc::SOCK_STREAM,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            io::Error::last_os_error().to_string(),
        )));
    }

    let connected = (|| -> io::Result<()> {
        let addr = SockAddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: address,
            rc_channel: channel,
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockAddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        configure_blocking_fd(fd, timeout)
    })();

    match connected {
        Ok(()) => Ok(RfcommStream {
            file: unsafe { File::from_raw_fd(fd) },
            read_timeout: timeout,
        }),
        Err(e) => {
            unsafe {
                libc::close(fd);
            }
            Err(DriverError::Bluetooth(BluetoothError::Connection(
                e.to_string(),
            )))
        }
    }
}
