// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Network Address and Port Translation (NAPT)
//!
//! This package translates flows from private senders so that they leave from the translation
//! node's own address and a locally allocated NAT port, remembers each mapping in a session table,
//! and translates replies addressed to that port back to the original sender.
//!
//! # Example
//!
//! ```
//! use napt_nat::{ChannelEgress, NatConfigBuilder, PortRange, TranslationEngine, Verdict};
//! use net::CapturedPacket;
//! use std::time::Instant;
//!
//! let config = NatConfigBuilder::default()
//!     .device("eth0")
//!     .node_addr([203, 0, 113, 1])
//!     .port_range(PortRange { start: 41000, end: 41000 })
//!     .build()
//!     .unwrap();
//! let (egress, sent) = ChannelEgress::unbounded();
//! let mut engine = TranslationEngine::from_config(&config, egress).unwrap();
//!
//! let query = CapturedPacket::udp(
//!     "192.168.1.5:33000".parse().unwrap(),
//!     "8.8.8.8:53".parse().unwrap(),
//!     "query",
//! );
//! let verdict = engine.process(&query, Instant::now()).unwrap();
//! assert!(matches!(verdict, Verdict::Forwarded { created: true, .. }));
//! assert_eq!(sent.recv().unwrap().local, "203.0.113.1:41000".parse().unwrap());
//! ```
//!
//! # Limitations
//!
//! - Only UDP datagrams and individual TCP segments are translated. TCP sequence numbers are left
//!   untouched, and ICMP is not supported.
//! - Addresses embedded in payloads are not translated.
//! - Sessions live in memory only.

mod allocator;
mod config;
mod engine;
mod io;
mod port;
mod rewrite;
mod session;
mod sync;
mod table;


pub use allocator::{
    AllocatorError, DefaultPortProbe, OsPortProbe, PortAllocator, PortProbe, RangePortProbe,
};
pub use config::{ConfigError, NatConfig, NatConfigBuilder, PortRange, SessionPolicy};
pub use engine::{EngineStats, NatError, SWEEP_INTERVAL, TranslationEngine, Verdict};
pub use io::{
    Capture, ChannelCapture, ChannelEgress, Egress, EgressError, EgressFrame, Polled, Shutdown,
};
pub use port::{NatPort, NatPortError};
pub use rewrite::{AddressIssue, Direction, PacketRewriter, RewriteError, RewrittenPacket};
pub use session::{Session, SessionState};
pub use table::{SessionSnapshot, SessionTable, SessionTableError, SharedSessionTable};
