//! The per-link tunnel cipher.
//!
//! A sealed link runs a Noise handshake pinned to the peer key named by the
//! exchanged fingerprint; nothing readable crosses the link before the
//! handshake completes, and a tampered fingerprint can never complete it.
//!
//! The cipher validates its plaintext as an IP packet, so overlay frames
//! travel inside a minimal IPv4 shim that is stripped again after
//! decryption.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use boringtun::noise::rate_limiter::RateLimiter;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};

/// Room for the largest overlay frame plus shim and cipher overhead.
const SCRATCH_SIZE: usize = 2048;

const SHIM_SIZE: usize = 20;

/// Handshakes per second the responder side will process.
const HANDSHAKE_RATE_LIMIT: u64 = 100;

const KEEPALIVE_SECS: u16 = 25;

pub(crate) struct SealedChannel {
    tunn: Tunn,
    scratch: Box<[u8; SCRATCH_SIZE]>,
}

/// What the cipher wants done with a processed datagram.
pub(crate) enum Opened {
    /// Protocol traffic to put back on the wire (handshake, keepalive).
    Network(Vec<u8>),
    /// A decrypted overlay frame (header + Ethernet bytes).
    Frame(Vec<u8>),
}

impl SealedChannel {
    pub(crate) fn new(local: StaticSecret, remote: PublicKey) -> Result<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(
            &PublicKey::from(&local),
            HANDSHAKE_RATE_LIMIT,
        ));

        let tunn = Tunn::new(
            local,
            remote,
            None,
            Some(KEEPALIVE_SECS),
            0,
            Some(rate_limiter),
        )
        .map_err(|e| anyhow!(e))
        .context("Failed to create the link cipher")?;

        Ok(Self {
            tunn,
            scratch: Box::new([0u8; SCRATCH_SIZE]),
        })
    }

    /// Whether a handshake has completed; the link is not ready before this.
    pub(crate) fn is_established(&self) -> bool {
        let (time_since_handshake, ..) = self.tunn.stats();

        time_since_handshake.is_some()
    }

    /// Starts (or re-starts) the handshake. The controlling side calls this
    /// once a pair is nominated.
    pub(crate) fn initiate(&mut self) -> Option<Vec<u8>> {
        match self.tunn.format_handshake_initiation(&mut self.scratch[..], false) {
            TunnResult::WriteToNetwork(bytes) => Some(bytes.to_vec()),
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                tracing::warn!("Failed to initiate cipher handshake: {e:?}");
                None
            }
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => None,
        }
    }

    /// Encrypts one overlay frame. Before the handshake completes the frame
    /// is queued by the cipher and the returned bytes are handshake traffic.
    pub(crate) fn seal(&mut self, frame_wire: &[u8]) -> Option<Vec<u8>> {
        let plaintext = shim_wrap(frame_wire);

        match self.tunn.encapsulate(&plaintext, &mut self.scratch[..]) {
            TunnResult::WriteToNetwork(bytes) => Some(bytes.to_vec()),
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                tracing::warn!("Failed to seal frame: {e:?}");
                None
            }
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => None,
        }
    }

    /// Decrypts one datagram and drains any protocol traffic the cipher
    /// queued behind it.
    pub(crate) fn open(&mut self, src: IpAddr, datagram: &[u8]) -> Vec<Opened> {
        let mut results = Vec::new();

        let first = self
            .tunn
            .decapsulate(Some(src), datagram, &mut self.scratch[..]);
        let mut draining = collect(first, &mut results);

        // After a handshake packet the cipher may hold queued payloads;
        // drain until it reports done.
        while draining {
            let next = self.tunn.decapsulate(None, &[], &mut self.scratch[..]);
            draining = collect(next, &mut results);
        }

        results
    }

    /// Drives retransmissions and keepalives; call on a steady tick.
    pub(crate) fn tick(&mut self) -> Option<Vec<u8>> {
        match self.tunn.update_timers(&mut self.scratch[..]) {
            TunnResult::WriteToNetwork(bytes) => Some(bytes.to_vec()),
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                tracing::debug!("Cipher timer: {e:?}");
                None
            }
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => None,
        }
    }
}

/// Appends the result to `results`; returns whether the caller should keep
/// draining queued protocol traffic.
fn collect(result: TunnResult<'_>, results: &mut Vec<Opened>) -> bool {
    match result {
        TunnResult::Done => false,
        TunnResult::WriteToNetwork(bytes) => {
            results.push(Opened::Network(bytes.to_vec()));
            true
        }
        TunnResult::WriteToTunnelV4(packet, _) => {
            match shim_unwrap(packet) {
                Some(frame) => results.push(Opened::Frame(frame.to_vec())),
                None => tracing::warn!("Decrypted packet without a valid shim"),
            }
            false
        }
        TunnResult::WriteToTunnelV6(..) => {
            tracing::warn!("Unexpected IPv6 plaintext from the link cipher");
            false
        }
        TunnResult::Err(e) => {
            tracing::debug!("Cipher rejected datagram: {e:?}");
            false
        }
    }
}

/// Wraps frame bytes in a minimal IPv4 header so the cipher's plaintext
/// validation accepts them.
fn shim_wrap(frame: &[u8]) -> Vec<u8> {
    let total = SHIM_SIZE + frame.len();
    let mut packet = Vec::with_capacity(total);

    packet.push(0x45); // version 4, header length 20
    packet.push(0);
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    packet.push(64); // ttl
    packet.push(0x61); // "any host internal protocol"; never routed
    packet.extend_from_slice(&[0, 0]); // checksum, unchecked on this path
    packet.extend_from_slice(&[0, 0, 0, 0]); // src 0.0.0.0
    packet.extend_from_slice(&[0, 0, 0, 0]); // dst 0.0.0.0
    packet.extend_from_slice(frame);

    packet
}

fn shim_unwrap(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < SHIM_SIZE || packet[0] != 0x45 {
        return None;
    }

    Some(&packet[SHIM_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    fn keypair(seed: u8) -> (StaticSecret, PublicKey) {
        let mut rng = StdRng::from_seed([seed; 32]);
        let secret = StaticSecret::random_from_rng(&mut rng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn shim_round_trips() {
        let frame = vec![0x0A, 0x01, 0xDE, 0xAD, 0xBE, 0xEF];

        let wrapped = shim_wrap(&frame);

        assert_eq!(wrapped.len(), frame.len() + SHIM_SIZE);
        assert_eq!(shim_unwrap(&wrapped).unwrap(), &frame[..]);
    }

    #[test]
    fn handshake_and_frame_exchange() {
        let (a_secret, a_public) = keypair(1);
        let (b_secret, b_public) = keypair(2);
        let src: IpAddr = "127.0.0.1".parse().unwrap();

        let mut a = SealedChannel::new(a_secret, b_public).unwrap();
        let mut b = SealedChannel::new(b_secret, a_public).unwrap();

        // A initiates; pump datagrams between the two until quiescent.
        let mut to_b = vec![a.initiate().unwrap()];
        let mut to_a: Vec<Vec<u8>> = Vec::new();
        for _ in 0..10 {
            let mut next_to_a = Vec::new();
            for datagram in to_b.drain(..) {
                for opened in b.open(src, &datagram) {
                    match opened {
                        Opened::Network(bytes) => next_to_a.push(bytes),
                        Opened::Frame(_) => panic!("no frames sent yet"),
                    }
                }
            }
            to_a = next_to_a;

            let mut next_to_b = Vec::new();
            for datagram in to_a.drain(..) {
                for opened in a.open(src, &datagram) {
                    match opened {
                        Opened::Network(bytes) => next_to_b.push(bytes),
                        Opened::Frame(_) => panic!("no frames sent yet"),
                    }
                }
            }
            to_b = next_to_b;

            if a.is_established() && b.is_established() {
                break;
            }
        }

        assert!(a.is_established());
        assert!(b.is_established());

        let frame = vec![0x0A, 0x01, 1, 2, 3, 4, 5, 6];
        let sealed = a.seal(&frame).unwrap();

        let opened = b.open(src, &sealed);
        let frames: Vec<_> = opened
            .iter()
            .filter_map(|o| match o {
                Opened::Frame(f) => Some(f.clone()),
                Opened::Network(_) => None,
            })
            .collect();

        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn wrong_pinned_key_never_establishes() {
        let (a_secret, _) = keypair(1);
        let (b_secret, b_public) = keypair(2);
        let (_, c_public) = keypair(3); // not B's key
        let src: IpAddr = "127.0.0.1".parse().unwrap();

        let mut a = SealedChannel::new(a_secret, c_public).unwrap();
        let mut b = SealedChannel::new(b_secret, PublicKey::from(&StaticSecret::random_from_rng(
            &mut StdRng::from_seed([9; 32]),
        )))
        .unwrap();

        let mut to_b = vec![a.initiate().unwrap()];
        for _ in 0..5 {
            let mut to_a = Vec::new();
            for datagram in to_b.drain(..) {
                for opened in b.open(src, &datagram) {
                    if let Opened::Network(bytes) = opened {
                        to_a.push(bytes);
                    }
                }
            }
            let mut next_to_b = Vec::new();
            for datagram in to_a {
                for opened in a.open(src, &datagram) {
                    if let Opened::Network(bytes) = opened {
                        next_to_b.push(bytes);
                    }
                }
            }
            to_b = next_to_b;
        }

        assert!(!a.is_established());
        assert!(!b.is_established());
    }
}
