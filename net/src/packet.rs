// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Structured capture records.
//!
//! A capture backend hands the translation core one [`CapturedPacket`] at a time. The record only
//! carries what the core needs: the flow addressing, the transport header fields that must survive
//! a rewrite, and the payload bytes.

use crate::flow::{FlowKey, Protocol};
use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TcpHeader, TransportSlice};
use std::net::{IpAddr, SocketAddr};
use tracing::trace;

/// Errors reported when a raw packet cannot be turned into a [`CapturedPacket`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The packet could not be sliced into headers
    #[error("truncated or malformed packet: {0}")]
    Truncated(String),
    /// No IPv4 or IPv6 header was found
    #[error("missing network layer")]
    MissingNetworkLayer,
    /// No transport header was found
    #[error("missing transport layer")]
    MissingTransportLayer,
    /// The transport protocol is neither UDP nor TCP
    #[error("unsupported transport protocol: {0}")]
    UnsupportedTransport(&'static str),
    /// A transport port is zero
    #[error("zero port in {0}")]
    ZeroPort(FlowKey),
}

/// Transport-specific fields carried along with a captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// A UDP datagram: nothing beyond the ports is needed to rebuild the header.
    Udp,
    /// A TCP segment. The header is kept as a template: flags, sequence numbers, window and
    /// options are reused when rebuilding the segment, ports and checksum are always overwritten.
    Tcp(TcpHeader),
}

impl Transport {
    /// The protocol this transport variant corresponds to
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Transport::Udp => Protocol::Udp,
            Transport::Tcp(_) => Protocol::Tcp,
        }
    }
}

/// One packet, as observed by a capture backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    flow: FlowKey,
    transport: Transport,
    payload: Bytes,
}

impl CapturedPacket {
    /// Build a UDP capture record.
    #[must_use]
    pub fn udp(src: SocketAddr, dst: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            flow: FlowKey::udp(src, dst),
            transport: Transport::Udp,
            payload: payload.into(),
        }
    }

    /// Build a TCP capture record. The ports of `header` are ignored in favor of `src` and `dst`.
    #[must_use]
    pub fn tcp(
        src: SocketAddr,
        dst: SocketAddr,
        mut header: TcpHeader,
        payload: impl Into<Bytes>,
    ) -> Self {
        header.source_port = src.port();
        header.destination_port = dst.port();
        Self {
            flow: FlowKey::tcp(src, dst),
            transport: Transport::Tcp(header),
            payload: payload.into(),
        }
    }

    /// Parse a raw IP packet (no link-layer header) into a capture record.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] if the packet is truncated, lacks a network or transport layer,
    /// uses a transport protocol other than UDP or TCP, or carries a zero port.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let sliced =
            SlicedPacket::from_ip(data).map_err(|e| PacketError::Truncated(e.to_string()))?;

        let (src_ip, dst_ip) = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => (
                IpAddr::V4(ipv4.header().source_addr()),
                IpAddr::V4(ipv4.header().destination_addr()),
            ),
            Some(NetSlice::Ipv6(ipv6)) => (
                IpAddr::V6(ipv6.header().source_addr()),
                IpAddr::V6(ipv6.header().destination_addr()),
            ),
            _ => return Err(PacketError::MissingNetworkLayer),
        };

        let (flow, transport, payload) = match &sliced.transport {
            Some(TransportSlice::Udp(udp)) => (
                FlowKey::udp(
                    SocketAddr::new(src_ip, udp.source_port()),
                    SocketAddr::new(dst_ip, udp.destination_port()),
                ),
                Transport::Udp,
                udp.payload(),
            ),
            Some(TransportSlice::Tcp(tcp)) => (
                FlowKey::tcp(
                    SocketAddr::new(src_ip, tcp.source_port()),
                    SocketAddr::new(dst_ip, tcp.destination_port()),
                ),
                Transport::Tcp(tcp.to_header()),
                tcp.payload(),
            ),
            Some(TransportSlice::Icmpv4(_)) => {
                return Err(PacketError::UnsupportedTransport("ICMPv4"));
            }
            Some(TransportSlice::Icmpv6(_)) => {
                return Err(PacketError::UnsupportedTransport("ICMPv6"));
            }
            None => return Err(PacketError::MissingTransportLayer),
        };

        if flow.src_port() == 0 || flow.dst_port() == 0 {
            return Err(PacketError::ZeroPort(flow));
        }

        trace!("parsed packet {flow} ({} payload bytes)", payload.len());
        Ok(Self {
            flow,
            transport,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Flow addressing of the packet
    #[must_use]
    pub const fn flow(&self) -> &FlowKey {
        &self.flow
    }

    /// Transport header fields of the packet
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Payload bytes, following the transport header
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // valid in tests
mod tests {
    use super::*;
    use crate::emit::emit;
    use etherparse::PacketBuilder;
    use pretty_assertions::assert_eq;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_udp_ipv4() {
        let raw = emit(
            sock("192.168.1.5:33000"),
            sock("8.8.8.8:53"),
            &Transport::Udp,
            b"query",
            64,
        )
        .unwrap();
        let packet = CapturedPacket::parse(&raw).unwrap();
        assert_eq!(
            packet,
            CapturedPacket::udp(sock("192.168.1.5:33000"), sock("8.8.8.8:53"), &b"query"[..])
        );
    }

    #[test]
    fn test_parse_tcp_ipv6_keeps_header_template() {
        let mut header = TcpHeader::new(1, 2, 1000, 4096);
        header.syn = true;
        let raw = emit(
            sock("[2001:db8::2]:40000"),
            sock("[2001:db8::1]:443"),
            &Transport::Tcp(header),
            b"hello",
            64,
        )
        .unwrap();
        let packet = CapturedPacket::parse(&raw).unwrap();
        assert_eq!(packet.flow().protocol(), Protocol::Tcp);
        assert_eq!(packet.flow().src(), sock("[2001:db8::2]:40000"));
        assert_eq!(packet.flow().dst(), sock("[2001:db8::1]:443"));
        assert_eq!(packet.payload(), b"hello");
        let Transport::Tcp(parsed) = packet.transport() else {
            unreachable!()
        };
        assert!(parsed.syn);
        assert_eq!(parsed.sequence_number, 1000);
        assert_eq!(parsed.window_size, 4096);
        assert_eq!(parsed.source_port, 40000);
    }

    #[test]
    fn test_parse_rejects_icmp() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).icmpv4_echo_request(1, 1);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"ping").unwrap();
        assert_eq!(
            CapturedPacket::parse(&raw),
            Err(PacketError::UnsupportedTransport("ICMPv4"))
        );
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let raw = emit(
            sock("10.0.0.2:5000"),
            sock("93.184.1.1:80"),
            &Transport::Udp,
            b"payload",
            64,
        )
        .unwrap();
        assert!(matches!(
            CapturedPacket::parse(&raw[..10]),
            Err(PacketError::Truncated(_))
        ));
        assert!(matches!(
            CapturedPacket::parse(&[]),
            Err(PacketError::Truncated(_))
        ));
    }

    #[test]
    fn test_parse_rejects_zero_port() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(0, 53);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"x").unwrap();
        assert!(matches!(
            CapturedPacket::parse(&raw),
            Err(PacketError::ZeroPort(_))
        ));
    }

    #[test]
    fn test_tcp_constructor_overrides_template_ports() {
        let packet = CapturedPacket::tcp(
            sock("10.0.0.2:5000"),
            sock("93.184.1.1:80"),
            TcpHeader::new(1, 1, 0, 1024),
            Bytes::new(),
        );
        let Transport::Tcp(header) = packet.transport() else {
            unreachable!()
        };
        assert_eq!(header.source_port, 5000);
        assert_eq!(header.destination_port, 80);
        assert_eq!(packet.transport().protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_parse_never_panics() {
        bolero::check!().with_type().for_each(|data: &Vec<u8>| {
            let _ = CapturedPacket::parse(data);
        });
    }
}
