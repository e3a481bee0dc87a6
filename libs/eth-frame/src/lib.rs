#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Ethernet frame buffers and classification for the overlay dataplane.
//!
//! A [`FrameBuffer`] owns a 2-byte overlay header followed by up to
//! [`TAP_BUFFER_SIZE`] bytes of Ethernet frame. The header carries one of the
//! three overlay magics and is only meaningful on a peer link; the TAP device
//! reads and writes the Ethernet region alone.

mod mac;
mod properties;

pub use mac::{MacAddr, MacParseError};
pub use properties::FrameProperties;

pub const ETH_HEADER_SIZE: usize = 14;
pub const MAX_MTU: usize = 1500;

/// Largest Ethernet frame the TAP device exchanges with us.
pub const TAP_BUFFER_SIZE: usize = ETH_HEADER_SIZE + MAX_MTU;

/// The overlay header in front of the Ethernet bytes on a peer link.
pub const OVERLAY_HEADER_SIZE: usize = 2;

/// Total backing storage of one frame buffer.
pub const FRAME_CAPACITY: usize = OVERLAY_HEADER_SIZE + TAP_BUFFER_SIZE;

/// Upper bound on an ICC payload; it occupies the Ethernet region.
pub const MAX_ICC: usize = TAP_BUFFER_SIZE;

/// Data frame: unwrap and deliver to the local TAP.
pub const DTF_MAGIC: u16 = 0x0A01;
/// Forwarded frame: re-transmit along the route cache.
pub const FWD_MAGIC: u16 = 0x0B01;
/// Inter-controller message: opaque payload for the controller.
pub const ICC_MAGIC: u16 = 0x0C01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Dtf,
    Fwd,
    Icc,
    Unknown(u16),
}

impl FrameKind {
    pub fn from_magic(magic: u16) -> Self {
        match magic {
            DTF_MAGIC => FrameKind::Dtf,
            FWD_MAGIC => FrameKind::Fwd,
            ICC_MAGIC => FrameKind::Icc,
            other => FrameKind::Unknown(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {TAP_BUFFER_SIZE}-byte maximum")]
    TooLarge(usize),
    #[error("frame of {0} bytes is shorter than an Ethernet header")]
    TooShort(usize),
}

/// Byte container for one overlay frame.
///
/// The buffer is fixed-capacity; `len` tracks how much of the Ethernet region
/// is in use. Buffers are handed out by the frame cache and recycled, so
/// [`FrameBuffer::initialize`] must restore a buffer to its pristine state.
pub struct FrameBuffer {
    data: Box<[u8; FRAME_CAPACITY]>,
    len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; FRAME_CAPACITY]),
            len: 0,
        }
    }

    /// Resets length and header for reuse. The payload bytes are left as-is;
    /// a fresh read overwrites them.
    pub fn initialize(&mut self) {
        self.len = 0;
        self.data[..OVERLAY_HEADER_SIZE].fill(0);
    }

    pub fn magic(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn set_magic(&mut self, magic: u16) {
        self.data[..OVERLAY_HEADER_SIZE].copy_from_slice(&magic.to_be_bytes());
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::from_magic(self.magic())
    }

    /// Length of the Ethernet region in use.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), FrameError> {
        if len > TAP_BUFFER_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        self.len = len;
        Ok(())
    }

    /// The Ethernet bytes in use.
    pub fn ethernet(&self) -> &[u8] {
        &self.data[OVERLAY_HEADER_SIZE..OVERLAY_HEADER_SIZE + self.len]
    }

    /// The whole Ethernet region, for filling by a device read.
    pub fn ethernet_region_mut(&mut self) -> &mut [u8] {
        &mut self.data[OVERLAY_HEADER_SIZE..]
    }

    /// Header plus Ethernet bytes: what goes onto a peer link.
    pub fn wire(&self) -> &[u8] {
        &self.data[..OVERLAY_HEADER_SIZE + self.len]
    }

    /// Loads a frame as received from a peer link (header included).
    pub fn load_wire(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() < OVERLAY_HEADER_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let payload = bytes.len() - OVERLAY_HEADER_SIZE;
        if payload > TAP_BUFFER_SIZE {
            return Err(FrameError::TooLarge(payload));
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = payload;
        Ok(())
    }

    /// Loads Ethernet bytes as read from the TAP (no header).
    pub fn load_ethernet(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() > TAP_BUFFER_SIZE {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        self.data[OVERLAY_HEADER_SIZE..OVERLAY_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        self.data[..OVERLAY_HEADER_SIZE].fill(0);
        Ok(())
    }

    pub fn properties(&self) -> FrameProperties<'_> {
        FrameProperties::new(self.ethernet())
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("magic", &format_args!("{:#06x}", self.magic()))
            .field("len", &self.len)
            .finish()
    }
}
