// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet serialization.
//!
//! [`emit`] lays out an IP header, a transport header and a payload into a byte buffer. Output is
//! deterministic: the same inputs always produce the same bytes, checksums included.

use crate::packet::Transport;
use etherparse::PacketBuilder;
use std::net::{IpAddr, SocketAddr};

/// Errors which may occur when emitting a packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    /// Source and destination addresses belong to different IP versions
    #[error("mixed address families: {src} -> {dst}")]
    MixedAddressFamilies {
        /// source address
        src: IpAddr,
        /// destination address
        dst: IpAddr,
    },
    /// The header could not be built or written (for example, the payload is too large)
    #[error("failed to build packet: {0}")]
    Build(String),
}

/// Serialize a packet going from `src` to `dst`, with the given transport header fields and
/// payload. `hop_limit` is used as the IPv4 TTL or the IPv6 hop limit.
///
/// For TCP, the header template is copied and only its ports are replaced; the checksum is
/// recomputed for the new addressing.
///
/// # Errors
///
/// Returns [`EmitError::MixedAddressFamilies`] if `src` and `dst` are not of the same IP version,
/// or [`EmitError::Build`] if headers cannot be serialized.
pub fn emit(
    src: SocketAddr,
    dst: SocketAddr,
    transport: &Transport,
    payload: &[u8],
    hop_limit: u8,
) -> Result<Vec<u8>, EmitError> {
    let builder = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            PacketBuilder::ipv4(src_ip.octets(), dst_ip.octets(), hop_limit)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            PacketBuilder::ipv6(src_ip.octets(), dst_ip.octets(), hop_limit)
        }
        (src_ip, dst_ip) => {
            return Err(EmitError::MixedAddressFamilies {
                src: src_ip,
                dst: dst_ip,
            });
        }
    };

    let mut out = Vec::new();
    match transport {
        Transport::Udp => {
            let builder = builder.udp(src.port(), dst.port());
            out.reserve_exact(builder.size(payload.len()));
            builder
                .write(&mut out, payload)
                .map_err(|e| EmitError::Build(e.to_string()))?;
        }
        Transport::Tcp(template) => {
            let mut header = template.clone();
            header.source_port = src.port();
            header.destination_port = dst.port();
            let builder = builder.tcp_header(header);
            out.reserve_exact(builder.size(payload.len()));
            builder
                .write(&mut out, payload)
                .map_err(|e| EmitError::Build(e.to_string()))?;
        }
    }
    Ok(out)
}
