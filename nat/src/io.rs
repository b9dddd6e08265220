// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Collaborators of the translation engine: where packets come from, and where translated
//! packets go.
//!
//! The engine depends only on the [`Capture`] and [`Egress`] traits. [`ChannelCapture`] and
//! [`ChannelEgress`] implement them over `crossbeam` channels carrying raw IP packets, which is
//! enough to wire the engine to any capture backend running in another thread.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use net::{CapturedPacket, PacketError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The outcome of waiting for a packet with a deadline
#[derive(Debug)]
pub enum Polled {
    /// A packet was captured, or a record that could not be parsed
    Ready(Result<CapturedPacket, PacketError>),
    /// Nothing arrived before the deadline
    TimedOut,
    /// The stream has ended
    Closed,
}

/// A source of captured packets.
pub trait Capture {
    /// Block until the next packet is available. Returns `None` once the stream has ended.
    fn next_packet(&mut self) -> Option<Result<CapturedPacket, PacketError>>;

    /// Wait for the next packet for at most `timeout`. Sources that cannot time out block as
    /// [`Capture::next_packet`] does.
    fn poll_packet(&mut self, timeout: Duration) -> Polled {
        let _ = timeout;
        match self.next_packet() {
            Some(packet) => Polled::Ready(packet),
            None => Polled::Closed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("egress channel disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A sink for translated packets.
pub trait Egress {
    /// Send `bytes`, a packet going from `local` to `remote`. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an [`EgressError`] if the packet could not be handed over.
    fn send(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        bytes: &[u8],
    ) -> Result<usize, EgressError>;
}

/// [`Capture`] reading raw IP packets from a channel.
#[derive(Debug, Clone)]
pub struct ChannelCapture {
    rx: Receiver<Bytes>,
}

impl ChannelCapture {
    #[must_use]
    pub fn new(rx: Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Create an unbounded channel and return its sending side along with the capture.
    #[must_use]
    pub fn unbounded() -> (Sender<Bytes>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, Self::new(rx))
    }
}

impl Capture for ChannelCapture {
    fn next_packet(&mut self) -> Option<Result<CapturedPacket, PacketError>> {
        let raw = self.rx.recv().ok()?;
        Some(CapturedPacket::parse(&raw))
    }

    fn poll_packet(&mut self, timeout: Duration) -> Polled {
        match self.rx.recv_timeout(timeout) {
            Ok(raw) => Polled::Ready(CapturedPacket::parse(&raw)),
            Err(RecvTimeoutError::Timeout) => Polled::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Polled::Closed,
        }
    }
}

/// A translated packet, as forwarded by [`ChannelEgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressFrame {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub bytes: Bytes,
}

/// [`Egress`] forwarding translated packets to a channel.
#[derive(Debug, Clone)]
pub struct ChannelEgress {
    tx: Sender<EgressFrame>,
}

impl ChannelEgress {
    #[must_use]
    pub fn new(tx: Sender<EgressFrame>) -> Self {
        Self { tx }
    }

    /// Create an unbounded channel and return the egress along with its receiving side.
    #[must_use]
    pub fn unbounded() -> (Self, Receiver<EgressFrame>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }
}

impl Egress for ChannelEgress {
    fn send(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        bytes: &[u8],
    ) -> Result<usize, EgressError> {
        let len = bytes.len();
        self.tx
            .send(EgressFrame {
                local,
                remote,
                bytes: Bytes::copy_from_slice(bytes),
            })
            .map_err(|_| EgressError::Disconnected)?;
        Ok(len)
    }
}

/// A shutdown request shared between the engine loops and whoever stops them. Loops check it
/// between packets.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::{FlowKey, Transport, emit};

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_channel_capture_parses_and_ends() {
        let (tx, mut capture) = ChannelCapture::unbounded();
        let raw = emit(
            sock("10.0.0.2:5000"),
            sock("8.8.8.8:53"),
            &Transport::Udp,
            b"query",
            64,
        )
        .unwrap();
        tx.send(Bytes::from(raw)).unwrap();
        tx.send(Bytes::from_static(&[0x45, 0x00])).unwrap();
        drop(tx);

        let packet = capture.next_packet().unwrap().unwrap();
        assert_eq!(
            packet.flow(),
            &FlowKey::udp(sock("10.0.0.2:5000"), sock("8.8.8.8:53"))
        );
        assert!(capture.next_packet().unwrap().is_err());
        assert!(capture.next_packet().is_none());
    }

    #[test]
    fn test_channel_capture_poll_timeout() {
        let (tx, mut capture) = ChannelCapture::unbounded();
        assert!(matches!(
            capture.poll_packet(Duration::from_millis(1)),
            Polled::TimedOut
        ));
        drop(tx);
        assert!(matches!(
            capture.poll_packet(Duration::from_millis(1)),
            Polled::Closed
        ));
    }

    #[test]
    fn test_channel_egress() {
        let (mut egress, rx) = ChannelEgress::unbounded();
        let written = egress
            .send(sock("203.0.113.1:40001"), sock("8.8.8.8:53"), b"abc")
            .unwrap();
        assert_eq!(written, 3);
        let frame = rx.recv().unwrap();
        assert_eq!(frame.local, sock("203.0.113.1:40001"));
        assert_eq!(frame.bytes.as_ref(), b"abc");

        drop(rx);
        assert!(matches!(
            egress.send(sock("203.0.113.1:40001"), sock("8.8.8.8:53"), b"abc"),
            Err(EgressError::Disconnected)
        ));
    }

    #[test]
    fn test_shutdown_is_shared() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        assert!(!other.is_requested());
        shutdown.request();
        assert!(other.is_requested());
    }
}
