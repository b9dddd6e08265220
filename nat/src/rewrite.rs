// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Header rewriting for translated packets.

use crate::session::Session;
use net::{CapturedPacket, EmitError, emit};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use tracing::trace;

/// Why an address was refused during a rewrite
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressIssue {
    #[error("unspecified address")]
    Unspecified,
    #[error("multicast or broadcast address")]
    Multicast,
    #[error("port 0")]
    ZeroPort,
    #[error("address family differs from {0}")]
    FamilyMismatch(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewriteError {
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: SocketAddr, reason: AddressIssue },
    /// The addresses were fine but the packet could not be serialized, for example because its
    /// payload does not fit in one IP packet
    #[error("cannot serialize packet: {0}")]
    Emit(EmitError),
}

/// The direction of a translated packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the private side to a remote peer, with the source replaced by the node's address
    /// and the NAT port
    Outbound,
    /// From a remote peer back to the private sender of the original flow
    Return,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Return => write!(f, "return"),
        }
    }
}

/// A rewritten packet, ready to hand over to egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenPacket {
    pub direction: Direction,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Builds the bytes of translated packets.
///
/// Output is deterministic: a given session and captured packet always produce the same bytes.
/// Payloads are copied unmodified; addresses embedded in payloads are not translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRewriter {
    node_addr: IpAddr,
    hop_limit: u8,
}

impl PacketRewriter {
    pub const DEFAULT_HOP_LIMIT: u8 = 64;

    #[must_use]
    pub fn new(node_addr: IpAddr, hop_limit: u8) -> Self {
        Self {
            node_addr,
            hop_limit,
        }
    }

    #[must_use]
    pub fn node_addr(&self) -> IpAddr {
        self.node_addr
    }

    #[must_use]
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Build the outbound packet for `packet`: source set to the node address and the session's
    /// NAT port, destination unchanged from the original flow.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidAddress`] if the destination is not a valid unicast
    /// endpoint of the node's address family, or [`RewriteError::Emit`] if the packet cannot be
    /// serialized.
    pub fn rewrite_outbound(
        &self,
        session: &Session,
        packet: &CapturedPacket,
    ) -> Result<RewrittenPacket, RewriteError> {
        let src = SocketAddr::new(self.node_addr, session.nat_port().into());
        let dst = session.remote_endpoint();
        self.check_destination(dst)?;
        self.build(Direction::Outbound, src, dst, packet)
    }

    /// Build the return packet for `packet`, a reply received from the session's remote peer:
    /// source kept as received, destination set back to the original private sender.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidAddress`] if the private endpoint is not a valid unicast
    /// endpoint, or if its family differs from the reply's source, and [`RewriteError::Emit`] if
    /// the packet cannot be serialized.
    pub fn rewrite_return(
        &self,
        session: &Session,
        packet: &CapturedPacket,
    ) -> Result<RewrittenPacket, RewriteError> {
        let src = packet.flow().src();
        let dst = session.private_endpoint();
        check_unicast(dst)?;
        self.build(Direction::Return, src, dst, packet)
    }

    fn check_destination(&self, dst: SocketAddr) -> Result<(), RewriteError> {
        check_unicast(dst)?;
        if dst.is_ipv4() != self.node_addr.is_ipv4() {
            return Err(RewriteError::InvalidAddress {
                addr: dst,
                reason: AddressIssue::FamilyMismatch(self.node_addr),
            });
        }
        Ok(())
    }

    fn build(
        &self,
        direction: Direction,
        src: SocketAddr,
        dst: SocketAddr,
        packet: &CapturedPacket,
    ) -> Result<RewrittenPacket, RewriteError> {
        let bytes = emit(src, dst, packet.transport(), packet.payload(), self.hop_limit).map_err(
            |e| match e {
                EmitError::MixedAddressFamilies { src: peer, .. } => RewriteError::InvalidAddress {
                    addr: dst,
                    reason: AddressIssue::FamilyMismatch(peer),
                },
                e @ EmitError::Build(_) => RewriteError::Emit(e),
            },
        )?;
        trace!(
            "rewrote {direction} packet {src} -> {dst} ({} bytes)",
            bytes.len()
        );
        Ok(RewrittenPacket {
            direction,
            src,
            dst,
            bytes,
        })
    }
}

fn check_unicast(addr: SocketAddr) -> Result<(), RewriteError> {
    let reason = if addr.port() == 0 {
        AddressIssue::ZeroPort
    } else if addr.ip().is_unspecified() {
        AddressIssue::Unspecified
    } else if is_multicast_or_broadcast(addr.ip()) {
        AddressIssue::Multicast
    } else {
        return Ok(());
    };
    Err(RewriteError::InvalidAddress { addr, reason })
}

fn is_multicast_or_broadcast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_multicast() || ip.is_broadcast(),
        IpAddr::V6(ip) => ip.is_multicast(),
    }
}
