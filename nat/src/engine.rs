// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The translation engine.
//!
//! The engine takes captured packets one at a time and decides which path each one takes:
//!
//! - a packet addressed to the node's own address is a return candidate. If the reverse index
//!   knows its (remote endpoint, NAT port) pair, it is translated back to the private sender of
//!   the original flow; otherwise it is dropped as unsolicited;
//! - any other packet is outbound. The flow's live session is reused if there is one, otherwise a
//!   NAT port is allocated and a session created, and the packet is sent with its source replaced
//!   by the node address and the NAT port.
//!
//! Per-flow states go `new -> forwarded -> closed` (first reply, when sessions close on reply) or
//! `forwarded -> expired` (idle timeout). Errors are per packet: the offending packet is dropped,
//! the error is logged and counted, and the loop carries on.

use crate::allocator::{AllocatorError, DefaultPortProbe, PortAllocator, PortProbe};
use crate::config::{ConfigError, NatConfig, SessionPolicy};
use crate::io::{Capture, Egress, EgressError, Polled, Shutdown};
use crate::port::NatPort;
use crate::rewrite::{PacketRewriter, RewriteError, RewrittenPacket};
use crate::session::{Session, SessionState};
use crate::table::{SessionSnapshot, SessionTableError, SharedSessionTable};
use net::{CapturedPacket, FlowKey, PacketError};
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long the run loop waits for a packet before looking for idle sessions
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Why a packet could not be translated
#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("port allocation failed: {0}")]
    Allocation(AllocatorError),
    #[error("session table error: {0}")]
    Table(SessionTableError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("failed to send packet to {remote}: {source}")]
    SendFailure {
        remote: SocketAddr,
        #[source]
        source: EgressError,
    },
    #[error("malformed packet: {0}")]
    Malformed(#[from] PacketError),
    #[error("unsolicited inbound packet {0}")]
    UnsolicitedInbound(FlowKey),
}

impl From<SessionTableError> for NatError {
    fn from(e: SessionTableError) -> Self {
        match e {
            SessionTableError::Allocation(e) => NatError::Allocation(e),
            e => NatError::Table(e),
        }
    }
}

/// What the engine did with a packet it translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Sent to the remote peer from the given NAT port. `created` tells whether the packet opened a
    /// new session.
    Forwarded { nat_port: NatPort, created: bool },
    /// Sent back to the private sender. `closed` tells whether the session was closed.
    Returned { nat_port: NatPort, closed: bool },
}

/// Counters kept by a [`TranslationEngine`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub forwarded: u64,
    pub returned: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
    pub malformed: u64,
    pub unsolicited: u64,
    pub exhausted: u64,
    pub invalid_address: u64,
    pub build_failures: u64,
    pub table_errors: u64,
    pub send_failures: u64,
}

impl EngineStats {
    fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Forwarded { created, .. } => {
                self.forwarded += 1;
                self.sessions_created += u64::from(created);
            }
            Verdict::Returned { closed, .. } => {
                self.returned += 1;
                self.sessions_closed += u64::from(closed);
            }
        }
    }

    fn record_error(&mut self, error: &NatError) {
        let counter = match error {
            NatError::Allocation(_) => &mut self.exhausted,
            NatError::Table(_) => &mut self.table_errors,
            NatError::Rewrite(RewriteError::InvalidAddress { .. }) => &mut self.invalid_address,
            NatError::Rewrite(RewriteError::Emit(_)) => &mut self.build_failures,
            NatError::SendFailure { .. } => &mut self.send_failures,
            NatError::Malformed(_) => &mut self.malformed,
            NatError::UnsolicitedInbound(_) => &mut self.unsolicited,
        };
        *counter += 1;
    }

    /// Number of packets dropped before reaching egress
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.malformed
            + self.unsolicited
            + self.exhausted
            + self.invalid_address
            + self.build_failures
            + self.table_errors
    }
}

impl Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        writeln!(f, "Translation stats")?;
        writeln!(f, "  forwarded    : {}", self.forwarded)?;
        writeln!(f, "  returned     : {}", self.returned)?;
        writeln!(
            f,
            "  sessions     : {} created, {} closed, {} expired",
            self.sessions_created, self.sessions_closed, self.sessions_expired
        )?;
        writeln!(
            f,
            "  dropped      : {} malformed, {} unsolicited, {} exhausted, {} invalid address, {} unbuildable, {} table errors",
            self.malformed,
            self.unsolicited,
            self.exhausted,
            self.invalid_address,
            self.build_failures,
            self.table_errors
        )?;
        writeln!(f, "  send failures: {}", self.send_failures)
    }
}

/// Translates packets between a private network and remote peers.
///
/// The engine owns its allocator, rewriter and egress, and shares its [`SharedSessionTable`]
/// with the workers created with [`TranslationEngine::worker`].
#[derive(Debug)]
pub struct TranslationEngine<E: Egress, P: PortProbe = DefaultPortProbe> {
    name: String,
    table: SharedSessionTable,
    allocator: PortAllocator<P>,
    rewriter: PacketRewriter,
    policy: SessionPolicy,
    egress: E,
    stats: EngineStats,
}

impl<E: Egress> TranslationEngine<E, DefaultPortProbe> {
    /// Build an engine with an empty table from a validated configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn from_config(config: &NatConfig, egress: E) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!("{}: Initializing with parameters:\n{config}", config.name);
        Ok(Self::new(
            &config.name,
            SharedSessionTable::new(),
            config.port_allocator()?,
            config.rewriter(),
            config.session_policy(),
            egress,
        ))
    }
}

impl<E: Egress, P: PortProbe> TranslationEngine<E, P> {
    #[must_use]
    pub fn new(
        name: &str,
        table: SharedSessionTable,
        allocator: PortAllocator<P>,
        rewriter: PacketRewriter,
        policy: SessionPolicy,
        egress: E,
    ) -> Self {
        Self {
            name: name.to_owned(),
            table,
            allocator,
            rewriter,
            policy,
            egress,
            stats: EngineStats::default(),
        }
    }

    /// Create another engine sharing this engine's session table, with its own egress. The new
    /// engine starts with a copy of this engine's allocator and fresh counters.
    #[must_use]
    pub fn worker<E2: Egress>(&self, name: &str, egress: E2) -> TranslationEngine<E2, P>
    where
        P: Clone,
    {
        TranslationEngine::new(
            name,
            self.table.clone(),
            self.allocator.clone(),
            self.rewriter,
            self.policy,
            egress,
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> &SharedSessionTable {
        &self.table
    }

    #[must_use]
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    #[must_use]
    pub fn egress(&self) -> &E {
        &self.egress
    }

    /// A copy of the live sessions, for diagnostics
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.table.snapshot()
    }

    /// Translate one packet and hand the result to egress.
    ///
    /// # Errors
    ///
    /// Returns a [`NatError`] if the packet was dropped or could not be sent. The table is left
    /// consistent in all cases.
    pub fn process(&mut self, packet: &CapturedPacket, now: Instant) -> Result<Verdict, NatError> {
        if packet.flow().dst_addr() == self.rewriter.node_addr() {
            self.process_return(packet, now)
        } else {
            self.process_outbound(packet, now)
        }
    }

    fn process_outbound(
        &mut self,
        packet: &CapturedPacket,
        now: Instant,
    ) -> Result<Verdict, NatError> {
        let flow = *packet.flow();
        let (session, created) = self.table.get_or_allocate(&mut self.allocator, flow, now)?;
        let nat_port = session.nat_port();
        if created {
            debug!(
                "{}: session {session}: {} -> {}",
                self.name,
                SessionState::New,
                SessionState::Forwarded
            );
        }

        let sent = self
            .rewriter
            .rewrite_outbound(&session, packet)
            .map_err(NatError::from)
            .and_then(|rewritten| self.send(&rewritten));
        if let Err(e) = sent {
            // A session created for a packet that never left would only hold its port
            if created && self.table.remove_if_flow(nat_port, &flow).is_some() {
                debug!("{}: released port {nat_port} of unsent flow {flow}", self.name);
            }
            return Err(e);
        }
        Ok(Verdict::Forwarded { nat_port, created })
    }

    fn process_return(&mut self, packet: &CapturedPacket, now: Instant) -> Result<Verdict, NatError> {
        let flow = *packet.flow();
        let nat_port =
            NatPort::new_checked(flow.dst_port()).map_err(|_| NatError::UnsolicitedInbound(flow))?;
        let closed = self.policy.close_on_reply;

        // Lookup, rewrite and close or refresh happen under one lock. On a rewrite failure nothing
        // is sent and the session stays as is.
        let rewriter = &self.rewriter;
        let (session, rewritten) = self
            .table
            .claim_reply(flow.src(), nat_port, flow.protocol(), now, closed, |session| {
                rewriter.rewrite_return(session, packet)
            })?
            .ok_or(NatError::UnsolicitedInbound(flow))?;
        if closed {
            debug!(
                "{}: session {session}: {} -> {}",
                self.name,
                SessionState::Forwarded,
                SessionState::Closed
            );
        }
        self.send(&rewritten)?;
        Ok(Verdict::Returned { nat_port, closed })
    }

    fn send(&mut self, packet: &RewrittenPacket) -> Result<(), NatError> {
        let written = self
            .egress
            .send(packet.src, packet.dst, &packet.bytes)
            .map_err(|source| NatError::SendFailure {
                remote: packet.dst,
                source,
            })?;
        debug!(
            "{}: sent {} packet {} -> {} ({written} bytes)",
            self.name, packet.direction, packet.src, packet.dst
        );
        Ok(())
    }

    /// Process a record from the capture source, logging and counting the outcome.
    pub fn handle(&mut self, captured: Result<CapturedPacket, PacketError>, now: Instant) {
        let result = captured
            .map_err(NatError::from)
            .and_then(|packet| self.process(&packet, now));
        match result {
            Ok(verdict) => self.stats.record(verdict),
            Err(e) => {
                self.stats.record_error(&e);
                if matches!(e, NatError::Table(_)) {
                    error!("{}: dropping packet: {e}", self.name);
                } else {
                    warn!("{}: dropping packet: {e}", self.name);
                }
            }
        }
    }

    /// Evict sessions idle for longer than the policy allows, if the policy sets an idle timeout.
    /// Returns the evicted sessions.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Session> {
        let Some(idle_timeout) = self.policy.idle_timeout else {
            return Vec::new();
        };
        let expired = self.table.expire_idle(now, idle_timeout);
        for session in &expired {
            debug!(
                "{}: session {session}: {} -> {}",
                self.name,
                SessionState::Forwarded,
                SessionState::Expired
            );
        }
        self.stats.sessions_expired += expired.len() as u64;
        expired
    }

    /// Translate packets from `capture` until the stream ends or `shutdown` is requested, and
    /// return the counters. Idle sessions are swept between packets.
    ///
    /// Sessions still live when the loop ends are left in the table.
    pub fn run<C: Capture>(&mut self, capture: &mut C, shutdown: &Shutdown) -> EngineStats {
        info!("{}: Starting translation loop", self.name);
        let mut last_sweep = Instant::now();
        loop {
            if shutdown.is_requested() {
                info!("{}: Shutdown requested", self.name);
                break;
            }
            match capture.poll_packet(SWEEP_INTERVAL) {
                Polled::Ready(captured) => self.handle(captured, Instant::now()),
                Polled::TimedOut => {}
                Polled::Closed => {
                    info!("{}: End of capture stream", self.name);
                    break;
                }
            }
            let now = Instant::now();
            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.sweep_expired(now);
                last_sweep = now;
            }
        }
        let live = self.table.len();
        if live > 0 {
            debug!("{}: {live} session(s) still live", self.name);
        }
        info!("{}: Stopped.\n{}", self.name, self.stats);
        self.stats.clone()
    }
}

#[cfg(all(test, feature = "shuttle"))]
mod tests_shuttle {
    use super::*;
    use crate::allocator::test_utils::ScriptedProbe;
    use crate::sync::{Arc, Mutex};
    use std::num::NonZero;

    #[derive(Debug, Clone, Default)]
    struct SharedEgress {
        frames: Arc<Mutex<Vec<(SocketAddr, SocketAddr)>>>,
    }

    impl Egress for SharedEgress {
        fn send(
            &mut self,
            local: SocketAddr,
            remote: SocketAddr,
            bytes: &[u8],
        ) -> Result<usize, EgressError> {
            self.frames.lock().unwrap().push((local, remote));
            Ok(bytes.len())
        }
    }

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // Two workers capture the same reply while a third one translates a new flow. Whatever the
    // interleaving, the reply goes out once, and the new flow keeps its session even when it is
    // given the port the reply just closed.
    #[test]
    fn test_workers_race_on_reply() {
        shuttle::check_random(
            || {
                let egress = SharedEgress::default();
                let engine = TranslationEngine::new(
                    "worker-0",
                    SharedSessionTable::new(),
                    PortAllocator::new(
                        ScriptedProbe::ports([41000, 41001]),
                        NonZero::new(2).unwrap(),
                    ),
                    PacketRewriter::new(
                        "203.0.113.1".parse().unwrap(),
                        PacketRewriter::DEFAULT_HOP_LIMIT,
                    ),
                    SessionPolicy::default(),
                    egress.clone(),
                );
                let query = FlowKey::udp(sock("192.168.1.5:33000"), sock("8.8.8.8:53"));
                engine
                    .table()
                    .insert(Session::new(query, NatPort::new_checked(41000).unwrap()))
                    .unwrap();
                let reply =
                    CapturedPacket::udp(sock("8.8.8.8:53"), sock("203.0.113.1:41000"), "answer");
                let fresh =
                    CapturedPacket::udp(sock("10.0.0.3:5000"), sock("1.1.1.1:443"), "hello");

                let handles: Vec<_> = [reply.clone(), reply, fresh.clone()]
                    .into_iter()
                    .enumerate()
                    .map(|(i, packet)| {
                        let mut worker = engine.worker(&format!("worker-{}", i + 1), egress.clone());
                        shuttle::thread::spawn(move || worker.process(&packet, Instant::now()).is_ok())
                    })
                    .collect();
                let results: Vec<bool> = handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .collect();

                // One of the two replies, and the new flow
                assert_eq!(results.iter().filter(|ok| **ok).count(), 2);
                assert!(results[2]);

                let replies = egress
                    .frames
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, remote)| *remote == sock("192.168.1.5:33000"))
                    .count();
                assert_eq!(replies, 1);

                let table = engine.table();
                assert!(table.lookup_flow(fresh.flow()).is_some());
                assert_eq!(table.len(), 1);
                table.assert_consistent();
            },
            1000,
        );
    }
}
