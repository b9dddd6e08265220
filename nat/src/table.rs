// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NAT session table.
//!
//! Sessions are stored in a primary index keyed by NAT port. Two derived indices are kept exactly
//! consistent with it on every insertion and removal:
//!
//! - the reverse index, keyed by (remote endpoint, NAT port), tells whether an incoming packet is
//!   the reply to a flow we translated, and gives back the private endpoint that sent it;
//! - the flow index, keyed by the original [`FlowKey`], finds the session of an outbound flow that
//!   was already translated.
//!
//! All three lookups are hash-based.

use crate::allocator::{AllocatorError, PortAllocator, PortProbe};
use crate::port::NatPort;
use crate::session::Session;
use crate::sync::{Arc, Mutex, MutexGuard};
use ahash::RandomState;
use net::{FlowKey, Protocol};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionTableError {
    #[error("NAT port {0} is already held by a live session")]
    DuplicateNatPort(NatPort),
    #[error("flow {0} already has a live session")]
    DuplicateFlow(FlowKey),
    #[error(transparent)]
    Allocation(#[from] AllocatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReverseKey {
    remote: SocketAddr,
    nat_port: NatPort,
}

type Index<K, V> = HashMap<K, V, RandomState>;

fn hasher_state() -> &'static RandomState {
    use std::sync::OnceLock;
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

/// The NAT mapping store. It exclusively owns all [`Session`] values; lookups hand out references
/// or copies, never the storage itself.
#[derive(Debug, Clone)]
pub struct SessionTable {
    sessions: Index<NatPort, Session>,
    reverse: Index<ReverseKey, SocketAddr>,
    flows: Index<FlowKey, NatPort>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Index::with_hasher(hasher_state().clone()),
            reverse: Index::with_hasher(hasher_state().clone()),
            flows: Index::with_hasher(hasher_state().clone()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn contains_nat_port(&self, nat_port: NatPort) -> bool {
        self.sessions.contains_key(&nat_port)
    }

    /// Add a session to all indices.
    ///
    /// # Errors
    ///
    /// Returns [`SessionTableError::DuplicateNatPort`] if a live session already holds the NAT
    /// port, or [`SessionTableError::DuplicateFlow`] if the flow already has a session. The table
    /// is left unchanged in both cases.
    pub fn insert(&mut self, session: Session) -> Result<(), SessionTableError> {
        let nat_port = session.nat_port();
        let flow = *session.flow();
        if self.sessions.contains_key(&nat_port) {
            error!("Refusing to insert session for {flow}: NAT port {nat_port} is in use");
            return Err(SessionTableError::DuplicateNatPort(nat_port));
        }
        if self.flows.contains_key(&flow) {
            error!("Refusing to insert session for {flow}: flow already translated");
            return Err(SessionTableError::DuplicateFlow(flow));
        }
        debug!("insert: {session}");
        self.reverse.insert(
            ReverseKey {
                remote: flow.dst(),
                nat_port,
            },
            flow.src(),
        );
        self.flows.insert(flow, nat_port);
        self.sessions.insert(nat_port, session);
        Ok(())
    }

    /// Remove the session holding `nat_port` from all indices. Removing a port that has no session
    /// is not an error.
    pub fn remove_by_nat_port(&mut self, nat_port: NatPort) -> Option<Session> {
        let Some(session) = self.sessions.remove(&nat_port) else {
            debug!("remove: no session for NAT port {nat_port}");
            return None;
        };
        debug!("remove: {session}");
        self.reverse.remove(&ReverseKey {
            remote: session.remote_endpoint(),
            nat_port,
        });
        self.flows.remove(session.flow());
        Some(session)
    }

    /// Find the session holding `nat_port`.
    #[must_use]
    pub fn lookup_forward(&self, nat_port: NatPort) -> Option<&Session> {
        self.sessions.get(&nat_port)
    }

    /// Decide whether a packet coming from `remote` and addressed to `nat_port` is a reply to a
    /// flow we translated. On a hit, returns the private endpoint the reply must be sent back to.
    #[must_use]
    pub fn lookup_reverse(&self, remote: SocketAddr, nat_port: NatPort) -> Option<SocketAddr> {
        self.reverse.get(&ReverseKey { remote, nat_port }).copied()
    }

    /// Find the session of an already-translated outbound flow.
    #[must_use]
    pub fn lookup_flow(&self, flow: &FlowKey) -> Option<&Session> {
        self.flows
            .get(flow)
            .and_then(|nat_port| self.sessions.get(nat_port))
    }

    /// Record activity on the session holding `nat_port`. Returns false if there is no such
    /// session.
    pub fn touch(&mut self, nat_port: NatPort, now: Instant) -> bool {
        match self.sessions.get_mut(&nat_port) {
            Some(session) => {
                session.touch(now);
                true
            }
            None => false,
        }
    }

    /// Remove the session holding `nat_port` only if it still translates `flow`. A port that was
    /// released and handed to another flow in the meantime is left alone.
    pub fn remove_if_flow(&mut self, nat_port: NatPort, flow: &FlowKey) -> Option<Session> {
        if self.flows.get(flow) != Some(&nat_port) {
            debug!("remove: NAT port {nat_port} no longer translates {flow}");
            return None;
        }
        self.remove_by_nat_port(nat_port)
    }

    /// Settle a reply from `remote` to `nat_port` in one step.
    ///
    /// On a reverse index hit for a session of the same `protocol`, `build` is called with the
    /// session. If it succeeds, the session is removed (`close`) or refreshed to `now`, and returned
    /// along with what `build` produced. If it fails, the session is left untouched and the error
    /// is returned. A miss gives `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the error of `build`.
    pub fn claim_reply<T, E>(
        &mut self,
        remote: SocketAddr,
        nat_port: NatPort,
        protocol: Protocol,
        now: Instant,
        close: bool,
        build: impl FnOnce(&Session) -> Result<T, E>,
    ) -> Result<Option<(Session, T)>, E> {
        if self.lookup_reverse(remote, nat_port).is_none() {
            return Ok(None);
        }
        let Some(session) = self
            .sessions
            .get(&nat_port)
            .filter(|session| session.flow().protocol() == protocol)
        else {
            return Ok(None);
        };
        let built = build(session)?;
        let session = if close {
            self.remove_by_nat_port(nat_port)
        } else {
            self.sessions.get_mut(&nat_port).map(|session| {
                session.touch(now);
                session.clone()
            })
        };
        Ok(session.map(|session| (session, built)))
    }

    /// Allocate a NAT port for `flow` and insert a new session for it, in one step: no other
    /// insertion can take the port between allocation and insertion.
    ///
    /// # Errors
    ///
    /// Returns [`SessionTableError::Allocation`] if no port could be allocated, or an insertion
    /// error (see [`SessionTable::insert`]).
    pub fn allocate_and_insert<P: PortProbe>(
        &mut self,
        allocator: &mut PortAllocator<P>,
        flow: FlowKey,
        now: Instant,
    ) -> Result<Session, SessionTableError> {
        if self.flows.contains_key(&flow) {
            return Err(SessionTableError::DuplicateFlow(flow));
        }
        let nat_port = allocator.allocate(flow.protocol(), |port| {
            self.sessions.contains_key(&port)
        })?;
        let session = Session::with_time(flow, nat_port, now);
        self.insert(session.clone())?;
        Ok(session)
    }

    /// Evict all sessions idle for at least `idle_timeout` at time `now`, and return them.
    pub fn expire_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<Session> {
        let expired: Vec<NatPort> = self
            .sessions
            .values()
            .filter(|session| session.is_idle(now, idle_timeout))
            .map(Session::nat_port)
            .collect();
        expired
            .into_iter()
            .filter_map(|nat_port| self.remove_by_nat_port(nat_port))
            .collect()
    }

    /// A copy of all sessions, ordered by NAT port.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(Session::nat_port);
        SessionSnapshot { sessions }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.sessions.len(), self.reverse.len());
        assert_eq!(self.sessions.len(), self.flows.len());
        for (nat_port, session) in &self.sessions {
            assert_eq!(*nat_port, session.nat_port());
            assert_eq!(
                self.lookup_reverse(session.remote_endpoint(), *nat_port),
                Some(session.private_endpoint())
            );
            assert_eq!(self.flows.get(session.flow()), Some(nat_port));
        }
    }
}

/// A read-only copy of the sessions of a table at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    sessions: Vec<Session>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Session> {
        self.sessions
    }
}

impl IntoIterator for SessionSnapshot {
    type Item = Session;
    type IntoIter = std::vec::IntoIter<Session>;

    fn into_iter(self) -> Self::IntoIter {
        self.sessions.into_iter()
    }
}

const LISTING_BORDER: &str =
    "+-------------------------------------------------------------------------+";

impl Display for SessionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{LISTING_BORDER}")?;
        writeln!(
            f,
            "| proto |     srcAddr     | srcPort |     dstAddr     | dstPort | natPort |"
        )?;
        writeln!(f, "{LISTING_BORDER}")?;
        for session in &self.sessions {
            let flow = session.flow();
            writeln!(
                f,
                "| {:<5} | {:<15} | {:<7} | {:<15} | {:<7} | {:<7} |",
                flow.protocol().as_str(),
                flow.src_addr().to_string(),
                flow.src_port(),
                flow.dst_addr().to_string(),
                flow.dst_port(),
                session.nat_port().as_u16(),
            )?;
        }
        writeln!(f, "{LISTING_BORDER}")
    }
}

impl Display for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// A [`SessionTable`] shared between workers. Every operation runs under one lock covering all
/// indices.
#[derive(Debug, Clone)]
pub struct SharedSessionTable {
    inner: Arc<Mutex<SessionTable>>,
}

impl SharedSessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A worker panicking while holding the lock leaves the indices consistent, since each
    // mutation completes before any call that could panic.
    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// See [`SessionTable::insert`].
    ///
    /// # Errors
    ///
    /// Fails if the NAT port or the flow already have a live session.
    pub fn insert(&self, session: Session) -> Result<(), SessionTableError> {
        self.lock().insert(session)
    }

    pub fn remove_by_nat_port(&self, nat_port: NatPort) -> Option<Session> {
        self.lock().remove_by_nat_port(nat_port)
    }

    #[must_use]
    pub fn lookup_forward(&self, nat_port: NatPort) -> Option<Session> {
        self.lock().lookup_forward(nat_port).cloned()
    }

    #[must_use]
    pub fn lookup_reverse(&self, remote: SocketAddr, nat_port: NatPort) -> Option<SocketAddr> {
        self.lock().lookup_reverse(remote, nat_port)
    }

    /// See [`SessionTable::claim_reply`]. `build` runs under the table lock.
    ///
    /// # Errors
    ///
    /// Returns the error of `build`.
    pub fn claim_reply<T, E>(
        &self,
        remote: SocketAddr,
        nat_port: NatPort,
        protocol: Protocol,
        now: Instant,
        close: bool,
        build: impl FnOnce(&Session) -> Result<T, E>,
    ) -> Result<Option<(Session, T)>, E> {
        self.lock()
            .claim_reply(remote, nat_port, protocol, now, close, build)
    }

    #[must_use]
    pub fn lookup_flow(&self, flow: &FlowKey) -> Option<Session> {
        self.lock().lookup_flow(flow).cloned()
    }

    pub fn touch(&self, nat_port: NatPort, now: Instant) -> bool {
        self.lock().touch(nat_port, now)
    }

    pub fn remove_if_flow(&self, nat_port: NatPort, flow: &FlowKey) -> Option<Session> {
        self.lock().remove_if_flow(nat_port, flow)
    }

    /// Return the live session of `flow`, refreshing it, or allocate a port and insert a new
    /// session for it. The boolean is true when a new session was created. The whole operation
    /// runs under the table lock.
    ///
    /// # Errors
    ///
    /// See [`SessionTable::allocate_and_insert`].
    pub fn get_or_allocate<P: PortProbe>(
        &self,
        allocator: &mut PortAllocator<P>,
        flow: FlowKey,
        now: Instant,
    ) -> Result<(Session, bool), SessionTableError> {
        let mut table = self.lock();
        if let Some(nat_port) = table.lookup_flow(&flow).map(Session::nat_port) {
            table.touch(nat_port, now);
            if let Some(session) = table.lookup_forward(nat_port) {
                return Ok((session.clone(), false));
            }
        }
        let session = table.allocate_and_insert(allocator, flow, now)?;
        Ok((session, true))
    }

    /// See [`SessionTable::allocate_and_insert`].
    ///
    /// # Errors
    ///
    /// Fails if no port can be allocated or the session cannot be inserted.
    pub fn allocate_and_insert<P: PortProbe>(
        &self,
        allocator: &mut PortAllocator<P>,
        flow: FlowKey,
        now: Instant,
    ) -> Result<Session, SessionTableError> {
        self.lock().allocate_and_insert(allocator, flow, now)
    }

    pub fn expire_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<Session> {
        self.lock().expire_idle(now, idle_timeout)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.lock().assert_consistent();
    }
}

impl Default for SharedSessionTable {
    fn default() -> Self {
        Self::from(SessionTable::new())
    }
}

impl From<SessionTable> for SharedSessionTable {
    fn from(table: SessionTable) -> Self {
        Self {
            inner: Arc::new(Mutex::new(table)),
        }
    }
}
