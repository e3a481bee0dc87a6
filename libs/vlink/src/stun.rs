//! A minimal STUN binding client for server-reflexive candidate discovery.
//!
//! Sans-IO: the link worker feeds it packets and deadlines and sends
//! whatever it wants transmitted from the link's own socket, so the mapped
//! address reflects the port the candidates advertise.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytecodec::{DecodeExt as _, EncodeExt as _};
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::{self, Attribute};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};

const STUN_TIMEOUT: Duration = Duration::from_secs(5);
const STUN_REFRESH: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct StunBinding {
    server: SocketAddr,
    state: State,
    mapped: Option<SocketAddr>,
    new_mappings: VecDeque<SocketAddr>,
    transmits: VecDeque<(SocketAddr, Vec<u8>)>,
}

#[derive(Debug)]
enum State {
    Initial,
    SentRequest { id: TransactionId, at: Instant },
    ReceivedResponse { at: Instant },
}

impl StunBinding {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            state: State::Initial,
            mapped: None,
            new_mappings: VecDeque::default(),
            transmits: VecDeque::default(),
        }
    }

    /// The observed server-reflexive address, once known.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped
    }

    /// Whether the binding has concluded one way or the other: a response
    /// arrived, or the first request ran out of time.
    pub fn is_resolved(&self, now: Instant) -> bool {
        match self.state {
            State::Initial => false,
            State::SentRequest { at, .. } => self.mapped.is_some() || at + STUN_TIMEOUT <= now,
            State::ReceivedResponse { .. } => true,
        }
    }

    /// Returns `true` if the packet was a binding response from our server.
    pub fn handle_input(&mut self, from: SocketAddr, packet: &[u8], now: Instant) -> bool {
        if from != self.server {
            return false;
        }

        let Ok(Ok(message)) = MessageDecoder::<Attribute>::default().decode_from_bytes(packet)
        else {
            return false;
        };

        match self.state {
            State::SentRequest { id, .. } if id == message.transaction_id() => {
                self.state = State::ReceivedResponse { at: now };
            }
            State::Initial | State::SentRequest { .. } | State::ReceivedResponse { .. } => {
                return false;
            }
        }

        let Some(mapped) = message.get_attribute::<XorMappedAddress>() else {
            tracing::warn!(server = %self.server, "Binding response without XOR-MAPPED-ADDRESS");
            return true;
        };

        let observed = mapped.address();
        match self.mapped {
            Some(current) if current != observed => {
                tracing::info!(%current, new = %observed, "Server-reflexive address changed");
            }
            None => {
                tracing::info!(mapped = %observed, "Discovered server-reflexive address");
            }
            Some(_) => return true,
        }

        self.mapped = Some(observed);
        self.new_mappings.push_back(observed);

        true
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            State::Initial => {
                tracing::debug!(server = %self.server, "Sending STUN binding request");
            }
            State::SentRequest { id, at } if at + STUN_TIMEOUT <= now => {
                tracing::debug!(?id, "STUN binding request timed out, retrying");
            }
            State::ReceivedResponse { at } if at + STUN_REFRESH <= now => {
                tracing::debug!("Refreshing STUN binding");
            }
            State::SentRequest { .. } | State::ReceivedResponse { .. } => return,
        }

        let request = Message::<Attribute>::new(
            MessageClass::Request,
            rfc5389::methods::BINDING,
            TransactionId::new(rand::random()),
        );
        let bytes = MessageEncoder::default()
            .encode_into_bytes(request.clone())
            .unwrap_or_default();

        self.state = State::SentRequest {
            id: request.transaction_id(),
            at: now,
        };
        self.transmits.push_back((self.server, bytes));
    }

    pub fn poll_mapped_address(&mut self) -> Option<SocketAddr> {
        self.new_mappings.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.transmits.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            State::Initial => None,
            State::SentRequest { at, .. } => Some(at + STUN_TIMEOUT),
            State::ReceivedResponse { at } => Some(at + STUN_REFRESH),
        }
    }
}
