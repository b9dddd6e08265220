// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::port::NatPort;
use net::FlowKey;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Lifecycle states of a translated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// First packet seen, no session yet
    New,
    /// Session stored, outbound packet sent
    Forwarded,
    /// Matching return packet seen, session removed
    Closed,
    /// No reply within the idle timeout, session evicted
    Expired,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            SessionState::New => "new",
            SessionState::Forwarded => "forwarded",
            SessionState::Closed => "closed",
            SessionState::Expired => "expired",
        };
        f.write_str(state)
    }
}

/// The mapping between an original, private-side flow and the NAT port allocated for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    flow: FlowKey,
    nat_port: NatPort,
    created_at: Instant,
    last_seen: Instant,
}

impl Session {
    #[must_use]
    pub fn new(flow: FlowKey, nat_port: NatPort) -> Self {
        Self::with_time(flow, nat_port, Instant::now())
    }

    #[must_use]
    pub fn with_time(flow: FlowKey, nat_port: NatPort, created_at: Instant) -> Self {
        Self {
            flow,
            nat_port,
            created_at,
            last_seen: created_at,
        }
    }

    /// The original flow, as sent by the private host
    #[must_use]
    pub fn flow(&self) -> &FlowKey {
        &self.flow
    }

    #[must_use]
    pub fn nat_port(&self) -> NatPort {
        self.nat_port
    }

    /// The private endpoint that originated the flow, and to which replies are sent back
    #[must_use]
    pub fn private_endpoint(&self) -> SocketAddr {
        self.flow.src()
    }

    /// The remote endpoint the flow is addressed to
    #[must_use]
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.flow.dst()
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Whether the session has seen no traffic for at least `idle_timeout` at time `now`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= idle_timeout
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via port {}", self.flow, self.nat_port)
    }
}
