//! The kernel TAP device: open/configure by interface name, and a blocking
//! reader/writer thread pair bridging the descriptor into channels.
//!
//! The device threads never touch dataplane state; they exchange pooled
//! frames with the engine through `mpsc` channels, so completions are always
//! delivered on the engine's dispatch task. A failed read keeps its buffer
//! and retries, keeping the read pipeline full.

#![cfg(target_os = "linux")]

pub mod ioctl;

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use eth_frame::MacAddr;
use frame_cache::{CACHE_IO_MAX, Frame, FrameCache};
use tokio::sync::mpsc;

use ioctl::{AddrPayload, FlagsPayload, HwAddrPayload, MtuPayload, Request, TUNSETIFF};

const TUN_DEV: &str = "/dev/net/tun\0";

/// How long the device threads block before re-checking their shutdown flag.
const IO_TICK: Duration = Duration::from_millis(250);

/// Everything needed to configure the kernel interface. The dataplane never
/// indexes by IP address; these values only reach the `SIOCSIF*` calls.
#[derive(Debug, Clone)]
pub struct TapDescriptor {
    pub name: String,
    pub ip4: Ipv4Addr,
    pub prefix4: u8,
    pub mtu4: u16,
}

/// An open TAP device.
pub struct TapDevice {
    shared: Arc<DeviceFd>,
    name: String,
    mac: MacAddr,
}

struct DeviceFd {
    fd: RawFd,
    /// Also used to configure the interface; kept for flag toggles.
    config_fd: RawFd,
    closed: AtomicBool,
}

impl DeviceFd {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Safety: first close; nothing uses the descriptors after the flag flips.
        unsafe {
            libc::close(self.fd);
            libc::close(self.config_fd);
        }
    }
}

impl Drop for DeviceFd {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channel ends of the device threads: frames read from the TAP arrive on
/// `reads`; frames sent into `writes` go out the TAP.
pub struct TapIo {
    pub reads: mpsc::Receiver<Frame>,
    pub writes: mpsc::Sender<Frame>,
}

impl TapDevice {
    /// Opens the TAP by interface name and configures address, netmask, MTU
    /// and ARP availability. The device is left down; call
    /// [`TapDevice::up`] once the dataplane is wired.
    pub fn open(desc: &TapDescriptor) -> Result<Self> {
        // Safety: standard open/socket syscalls with constant arguments.
        let fd = unsafe { libc::open(TUN_DEV.as_ptr() as _, libc::O_RDWR) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .context("Failed to open the TAP clone device");
        }

        let config_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if config_fd < 0 {
            unsafe { libc::close(fd) };
            return Err(std::io::Error::last_os_error())
                .context("Failed to open the interface configuration socket");
        }

        let shared = Arc::new(DeviceFd {
            fd,
            config_fd,
            closed: AtomicBool::new(false),
        });

        let mut req = Request::new(
            &desc.name,
            FlagsPayload {
                flags: (libc::IFF_TAP | libc::IFF_NO_PI) as _,
            },
        )?;
        // Safety: payload layout matches TUNSETIFF's ifreq contract.
        unsafe { ioctl::exec(fd, TUNSETIFF, &mut req) }
            .with_context(|| format!("Failed to attach to TAP device `{}`", desc.name))?;

        let device = Self {
            shared,
            name: desc.name.clone(),
            mac: read_mac(config_fd, &desc.name)?,
        };

        device.configure_ip4(desc)?;
        device.set_mtu(desc.mtu4)?;
        // The overlay bridges ARP through the TAP; make sure the kernel
        // resolves over it.
        device.set_flags(0, libc::IFF_NOARP as _)?;

        tracing::info!(name = %device.name, mac = %device.mac, "Opened TAP device");

        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn up(&self) -> Result<()> {
        self.set_flags((libc::IFF_UP | libc::IFF_RUNNING) as _, 0)
    }

    pub fn down(&self) -> Result<()> {
        self.set_flags(0, (libc::IFF_UP | libc::IFF_RUNNING) as _)
    }

    /// Idempotent; in-flight reads and writes fail and their threads exit.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Spawns the reader and writer threads and hands back their channels.
    pub fn start(&self, cache: FrameCache) -> TapIo {
        let (reads_tx, reads) = mpsc::channel(CACHE_IO_MAX);
        let (writes, writes_rx) = mpsc::channel(CACHE_IO_MAX);

        let reader_shared = self.shared.clone();
        let reader_name = self.name.clone();
        std::thread::Builder::new()
            .name(format!("tap-read-{}", self.name))
            .spawn(move || read_loop(reader_shared, cache, reads_tx, reader_name))
            .expect("spawning the TAP reader thread");

        let writer_shared = self.shared.clone();
        let writer_name = self.name.clone();
        std::thread::Builder::new()
            .name(format!("tap-write-{}", self.name))
            .spawn(move || write_loop(writer_shared, writes_rx, writer_name))
            .expect("spawning the TAP writer thread");

        TapIo { reads, writes }
    }

    fn configure_ip4(&self, desc: &TapDescriptor) -> Result<()> {
        let mut addr = Request::new(
            &desc.name,
            AddrPayload {
                addr: ioctl::sockaddr_in_from(desc.ip4),
            },
        )?;
        // Safety: AddrPayload matches the ifreq address layout.
        unsafe { ioctl::exec(self.shared.config_fd, libc::SIOCSIFADDR, &mut addr) }
            .context("Failed to set the interface address")?;

        let mut mask = Request::new(
            &desc.name,
            AddrPayload {
                addr: ioctl::sockaddr_in_from(ioctl::netmask_from_prefix(desc.prefix4)),
            },
        )?;
        // Safety: as above.
        unsafe { ioctl::exec(self.shared.config_fd, libc::SIOCSIFNETMASK, &mut mask) }
            .context("Failed to set the interface netmask")?;

        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> Result<()> {
        let mut req = Request::new(&self.name, MtuPayload { mtu: mtu.into() })?;
        // Safety: MtuPayload matches the ifreq MTU layout.
        unsafe { ioctl::exec(self.shared.config_fd, libc::SIOCSIFMTU, &mut req) }
            .context("Failed to set the interface MTU")
    }

    /// Reads the current interface flags, sets the high bits of `enable`,
    /// clears the high bits of `disable`, and writes the result back.
    fn set_flags(&self, enable: libc::c_short, disable: libc::c_short) -> Result<()> {
        let mut req = Request::new(&self.name, FlagsPayload { flags: 0 })?;
        // Safety: FlagsPayload matches the ifreq flags layout.
        unsafe {
            ioctl::exec(self.shared.config_fd, libc::SIOCGIFFLAGS, &mut req)
                .context("Failed to read the interface flags")?;

            req.payload.flags |= enable;
            req.payload.flags &= !disable;

            ioctl::exec(self.shared.config_fd, libc::SIOCSIFFLAGS, &mut req)
                .context("Failed to write the interface flags")
        }
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_mac(config_fd: RawFd, name: &str) -> Result<MacAddr> {
    let mut req = Request::new(
        name,
        HwAddrPayload {
            // Safety: all-zeroes is a valid sockaddr.
            addr: unsafe { std::mem::zeroed() },
        },
    )?;
    // Safety: HwAddrPayload matches the ifreq hardware-address layout.
    unsafe { ioctl::exec(config_fd, libc::SIOCGIFHWADDR, &mut req) }
        .context("Failed to read the TAP hardware address")?;

    let octets: Vec<u8> = req.payload.addr.sa_data[..6]
        .iter()
        .map(|b| *b as u8)
        .collect();

    MacAddr::from_slice(&octets).context("Kernel returned a malformed hardware address")
}

fn read_loop(
    shared: Arc<DeviceFd>,
    cache: FrameCache,
    reads_tx: mpsc::Sender<Frame>,
    name: String,
) {
    let mut pending: Option<Frame> = None;

    loop {
        if shared.is_closed() {
            break;
        }

        // Renting the buffer first applies the cache's backpressure to the
        // device: while the pool sits at its high-water mark, no new read is
        // posted and the kernel queues (or drops) on our behalf.
        let mut frame = match pending.take() {
            Some(frame) => frame,
            None => match cache.acquire_timeout(IO_TICK) {
                Some(frame) => frame,
                None => continue,
            },
        };

        match wait_readable(shared.fd, IO_TICK) {
            Ok(true) => {}
            Ok(false) => {
                pending = Some(frame);
                continue;
            }
            Err(e) => {
                if !shared.is_closed() {
                    tracing::warn!(%name, "TAP poll failed: {e}");
                }
                break;
            }
        }

        let region = frame.ethernet_region_mut();
        // Safety: region is valid for writes of its whole length.
        let n = unsafe { libc::read(shared.fd, region.as_mut_ptr() as _, region.len()) };

        if n <= 0 {
            if shared.is_closed() {
                break;
            }
            tracing::warn!(%name, "TAP read failed: {}", std::io::Error::last_os_error());
            frame.initialize();
            pending = Some(frame);
            continue;
        }

        if frame.set_len(n as usize).is_err() {
            tracing::warn!(%name, len = n as usize, "Discarding oversized TAP read");
            frame.initialize();
            pending = Some(frame);
            continue;
        }

        if reads_tx.blocking_send(frame).is_err() {
            // Engine gone; nothing left to read for.
            break;
        }
    }

    tracing::debug!(%name, "TAP reader thread exited");
}

fn write_loop(shared: Arc<DeviceFd>, mut writes_rx: mpsc::Receiver<Frame>, name: String) {
    while let Some(frame) = writes_rx.blocking_recv() {
        if shared.is_closed() {
            break;
        }

        let eth = frame.ethernet();
        // Safety: eth is valid for reads of its whole length.
        let n = unsafe { libc::write(shared.fd, eth.as_ptr() as _, eth.len()) };

        if n < 0 {
            tracing::warn!(%name, "TAP write failed: {}", std::io::Error::last_os_error());
        } else if (n as usize) != eth.len() {
            tracing::warn!(%name, wrote = n as usize, expected = eth.len(), "Short TAP write");
        }
        // Frame drops here and returns to the cache.
    }

    tracing::debug!(%name, "TAP writer thread exited");
}

fn wait_readable(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // Safety: pollfd is a valid pollfd array of length 1.
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as _) };

    match ret {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            Err(e)
        }
    }
}
