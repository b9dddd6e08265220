// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT port allocation.
//!
//! The [`PortAllocator`] asks a [`PortProbe`] for candidate ports and keeps the first one that is
//! usable as a [`NatPort`] and not already held by a live session. Probing is retried in a bounded
//! loop: after `max_attempts` unsuccessful probes, allocation fails with
//! [`AllocatorError::PortExhaustion`].

use crate::port::NatPort;
use net::Protocol;
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::num::NonZero;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("no free {protocol} port found after {attempts} attempt(s)")]
    PortExhaustion { protocol: Protocol, attempts: u32 },
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

/// A source of candidate ports.
///
/// A probe only proposes ports; the [`PortAllocator`] decides whether a candidate is acceptable.
pub trait PortProbe {
    /// Return a candidate port for a flow using `protocol`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no candidate could be obtained. The allocator counts this as one
    /// failed attempt.
    fn probe(&mut self, protocol: Protocol) -> io::Result<u16>;
}

/// Probe the operating system for a free ephemeral port: bind port 0 on the probe address, read
/// back the port the system assigned, and release the socket.
#[derive(Debug, Clone)]
pub struct OsPortProbe {
    bind_addr: IpAddr,
}

impl OsPortProbe {
    #[must_use]
    pub fn new(bind_addr: IpAddr) -> Self {
        Self { bind_addr }
    }

    #[must_use]
    pub fn bind_addr(&self) -> IpAddr {
        self.bind_addr
    }
}

impl PortProbe for OsPortProbe {
    fn probe(&mut self, protocol: Protocol) -> io::Result<u16> {
        let addr = SocketAddr::new(self.bind_addr, 0);
        // The probe socket is dropped when leaving each arm, on success and on error alike.
        match protocol {
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr)?;
                Ok(socket.local_addr()?.port())
            }
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr)?;
                Ok(listener.local_addr()?.port())
            }
        }
    }
}

/// Pick candidate ports within a configured range, without involving the operating system.
/// Useful when the translation address is not bound locally.
///
/// The first candidate is drawn at random; later ones walk the range in order from there, wrapping
/// around at its end. Any `n` consecutive candidates are therefore distinct as long as `n` does not
/// exceed the size of the range, so an allocator allowed at least that many attempts finds a free
/// port whenever one exists.
#[derive(Debug, Clone)]
pub struct RangePortProbe {
    range: RangeInclusive<u16>,
    next: Option<u16>,
}

impl RangePortProbe {
    /// Build a probe drawing from `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::InvalidRange`] if the range is empty or reaches into reserved
    /// ports (below [`NatPort::MIN`]).
    pub fn new(start: u16, end: u16) -> Result<Self, AllocatorError> {
        if start > end || start < NatPort::MIN {
            return Err(AllocatorError::InvalidRange { start, end });
        }
        Ok(Self {
            range: start..=end,
            next: None,
        })
    }

    #[must_use]
    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }
}

impl PortProbe for RangePortProbe {
    fn probe(&mut self, _protocol: Protocol) -> io::Result<u16> {
        let (start, end) = (*self.range.start(), *self.range.end());
        let port = self
            .next
            .unwrap_or_else(|| rand::rng().random_range(start..=end));
        self.next = Some(if port >= end { start } else { port + 1 });
        Ok(port)
    }
}

/// The probe selected by configuration: either the operating system or a port range.
#[derive(Debug, Clone)]
pub enum DefaultPortProbe {
    Os(OsPortProbe),
    Range(RangePortProbe),
}

impl PortProbe for DefaultPortProbe {
    fn probe(&mut self, protocol: Protocol) -> io::Result<u16> {
        match self {
            DefaultPortProbe::Os(probe) => probe.probe(protocol),
            DefaultPortProbe::Range(probe) => probe.probe(protocol),
        }
    }
}

/// Allocates NAT ports with a bounded number of probe attempts.
#[derive(Debug, Clone)]
pub struct PortAllocator<P: PortProbe> {
    probe: P,
    max_attempts: NonZero<u32>,
}

impl<P: PortProbe> PortAllocator<P> {
    #[allow(clippy::unwrap_used)] // safe due to const-eval
    pub const DEFAULT_MAX_ATTEMPTS: NonZero<u32> = NonZero::new(5).unwrap();

    #[must_use]
    pub fn new(probe: P, max_attempts: NonZero<u32>) -> Self {
        Self {
            probe,
            max_attempts,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> NonZero<u32> {
        self.max_attempts
    }

    #[must_use]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Allocate a port for a flow using `protocol`. `in_use` tells whether a candidate port is
    /// already held by a live session; such candidates are skipped.
    ///
    /// Each probe failure, reserved candidate or in-use candidate consumes one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::PortExhaustion`] once `max_attempts` attempts have failed.
    pub fn allocate(
        &mut self,
        protocol: Protocol,
        in_use: impl Fn(NatPort) -> bool,
    ) -> Result<NatPort, AllocatorError> {
        let max_attempts = self.max_attempts.get();
        for attempt in 1..=max_attempts {
            let candidate = match self.probe.probe(protocol) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("{protocol} port probe failed (attempt {attempt}/{max_attempts}): {e}");
                    continue;
                }
            };
            let port = match NatPort::new_checked(candidate) {
                Ok(port) => port,
                Err(e) => {
                    debug!("Discarding candidate (attempt {attempt}/{max_attempts}): {e}");
                    continue;
                }
            };
            if in_use(port) {
                debug!(
                    "Discarding candidate {port}, held by a live session (attempt {attempt}/{max_attempts})"
                );
                continue;
            }
            debug!("Allocated {protocol} port {port} (attempt {attempt}/{max_attempts})");
            return Ok(port);
        }
        Err(AllocatorError::PortExhaustion {
            protocol,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::PortProbe;
    use net::Protocol;
    use std::collections::VecDeque;
    use std::io;

    /// A probe returning a scripted sequence of results, then failing forever.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ScriptedProbe {
        script: VecDeque<Result<u16, io::ErrorKind>>,
        pub(crate) calls: usize,
    }

    impl ScriptedProbe {
        pub(crate) fn new(script: impl IntoIterator<Item = Result<u16, io::ErrorKind>>) -> Self {
            Self {
                script: script.into_iter().collect(),
                calls: 0,
            }
        }

        pub(crate) fn ports(ports: impl IntoIterator<Item = u16>) -> Self {
            Self::new(ports.into_iter().map(Ok))
        }
    }

    impl PortProbe for ScriptedProbe {
        fn probe(&mut self, _protocol: Protocol) -> io::Result<u16> {
            self.calls += 1;
            match self.script.pop_front() {
                Some(Ok(port)) => Ok(port),
                Some(Err(kind)) => Err(io::Error::from(kind)),
                None => Err(io::Error::from(io::ErrorKind::AddrInUse)),
            }
        }
    }
}
