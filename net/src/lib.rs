// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![forbid(unsafe_code)]
#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Packet model for the address and port translator.
//!
//! This crate holds the types shared by the translation core and its collaborators:
//!
//! - [`FlowKey`]: the directional (protocol, source, destination) tuple identifying one side of a
//!   conversation,
//! - [`CapturedPacket`]: the structured record handed over by a capture backend, obtained by
//!   parsing a raw IP packet with [`CapturedPacket::parse`],
//! - [`emit()`]: serialization of an IP header, a transport header and a payload into bytes.
//!
//! Header layout is delegated to [`etherparse`]; nothing here keeps state.

pub mod emit;
pub mod flow;
pub mod packet;

pub use emit::{EmitError, emit};
pub use flow::{FlowKey, Protocol};
pub use packet::{CapturedPacket, PacketError, Transport};
