// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow identification.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

/// Transport protocols the translator knows how to rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// User Datagram Protocol
    Udp,
    /// Transmission Control Protocol
    Tcp,
}

impl Protocol {
    /// Short, upper-case name of the protocol, as used in listings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directional flow: one side of a conversation.
///
/// The key is immutable once built. Its reverse, as obtained with [`FlowKey::reverse`], identifies
/// the other side of the same conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    protocol: Protocol,
    src: SocketAddr,
    dst: SocketAddr,
}

impl FlowKey {
    /// Build a new flow key.
    #[must_use]
    pub const fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// Shorthand for a UDP flow.
    #[must_use]
    pub const fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Udp, src, dst)
    }

    /// Shorthand for a TCP flow.
    #[must_use]
    pub const fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, src, dst)
    }

    /// Transport protocol of the flow
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Source endpoint (address and port)
    #[must_use]
    pub const fn src(&self) -> SocketAddr {
        self.src
    }

    /// Destination endpoint (address and port)
    #[must_use]
    pub const fn dst(&self) -> SocketAddr {
        self.dst
    }

    /// Source address
    #[must_use]
    pub const fn src_addr(&self) -> IpAddr {
        self.src.ip()
    }

    /// Source port
    #[must_use]
    pub const fn src_port(&self) -> u16 {
        self.src.port()
    }

    /// Destination address
    #[must_use]
    pub const fn dst_addr(&self) -> IpAddr {
        self.dst.ip()
    }

    /// Destination port
    #[must_use]
    pub const fn dst_port(&self) -> u16 {
        self.dst.port()
    }

    /// The flow key for the opposite direction of the conversation.
    #[must_use]
    pub const fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} -> {}", self.protocol, self.src, self.dst)
    }
}
