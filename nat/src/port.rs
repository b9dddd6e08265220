// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT port: a type to represent the local L4 ports substituted for the source port of translated
//! flows.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZero;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NatPortError {
    #[error("reserved port ({0})")]
    ReservedPort(u16),
}

/// `NatPort` is a port usable as a translation port. It is a wrapper around a non-zero `u16` that
/// excludes the well-known range: translated flows never borrow a port below [`NatPort::MIN`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub struct NatPort(NonZero<u16>);

impl NatPort {
    /// Lowest port number a session may be allocated.
    pub const MIN: u16 = 1024 + 1;

    /// Build a [`NatPort`] from a raw port number.
    ///
    /// # Errors
    ///
    /// Returns [`NatPortError::ReservedPort`] if `port` is zero or within the well-known range.
    pub fn new_checked(port: u16) -> Result<NatPort, NatPortError> {
        if port < Self::MIN {
            return Err(NatPortError::ReservedPort(port));
        }
        NonZero::new(port)
            .map(NatPort)
            .ok_or(NatPortError::ReservedPort(port))
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for NatPort {
    type Error = NatPortError;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        Self::new_checked(port)
    }
}

impl From<NatPort> for u16 {
    fn from(port: NatPort) -> Self {
        port.as_u16()
    }
}

impl From<NatPort> for NonZero<u16> {
    fn from(port: NatPort) -> Self {
        port.0
    }
}

impl Display for NatPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ports_rejected() {
        assert_eq!(NatPort::new_checked(0), Err(NatPortError::ReservedPort(0)));
        assert_eq!(
            NatPort::new_checked(1024),
            Err(NatPortError::ReservedPort(1024))
        );
        assert_eq!(NatPort::new_checked(1025).unwrap().as_u16(), 1025);
        assert_eq!(NatPort::new_checked(u16::MAX).unwrap().as_u16(), u16::MAX);
    }

    #[test]
    fn test_conversions() {
        let port = NatPort::try_from(40001).unwrap();
        assert_eq!(u16::from(port), 40001);
        assert_eq!(NonZero::<u16>::from(port).get(), 40001);
        assert_eq!(port.to_string(), "40001");
    }
}
