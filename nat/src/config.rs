// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration of a translation engine

use crate::allocator::{
    AllocatorError, DefaultPortProbe, OsPortProbe, PortAllocator, RangePortProbe,
};
use crate::rewrite::PacketRewriter;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZero;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid node address {0}: must be a unicast address")]
    InvalidNodeAddr(IpAddr),
    #[error("probe address {probe} and node address {node} are of different families")]
    ProbeFamilyMismatch { probe: IpAddr, node: IpAddr },
    #[error(transparent)]
    InvalidPortRange(#[from] AllocatorError),
    #[error("missing or invalid configuration field: {0}")]
    Builder(#[from] NatConfigBuilderError),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

/// An inclusive range of ports to draw NAT ports from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// What happens to a session once it has been forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Close the session when the first reply is translated back
    pub close_on_reply: bool,
    /// Evict sessions without activity for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            close_on_reply: true,
            idle_timeout: None,
        }
    }
}

fn default_name() -> String {
    "napt".to_string()
}
fn default_max_attempts() -> NonZero<u32> {
    PortAllocator::<DefaultPortProbe>::DEFAULT_MAX_ATTEMPTS
}
fn default_hop_limit() -> u8 {
    PacketRewriter::DEFAULT_HOP_LIMIT
}
fn default_close_on_reply() -> bool {
    true
}

/// Configuration of a translation engine. N.B. we derive a builder type `NatConfigBuilder`,
/// with defaults for all fields but the capture device and the node address.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder(build_fn(private, name = "build_unchecked"))]
pub struct NatConfig {
    #[builder(setter(into), default = default_name())]
    #[serde(default = "default_name")]
    pub name: String,

    /// Identifier of the interface packets are captured from
    #[builder(setter(into))]
    pub device: String,

    /// The translation node's own address, used as the source of outbound packets
    #[builder(setter(into))]
    pub node_addr: IpAddr,

    /// Address the OS port probe binds to. Defaults to the loopback address of the node
    /// address family.
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub probe_addr: Option<IpAddr>,

    #[builder(default = default_max_attempts())]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: NonZero<u32>,

    #[builder(default = default_hop_limit())]
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,

    /// When set, NAT ports are taken from this range instead of probing the OS. Candidates walk
    /// the range from a random start, so with `max_attempts` at least the size of the range a
    /// free port is always found when one exists.
    #[builder(setter(strip_option), default)]
    #[serde(default)]
    pub port_range: Option<PortRange>,

    #[builder(default = default_close_on_reply())]
    #[serde(default = "default_close_on_reply")]
    pub close_on_reply: bool,

    #[builder(setter(strip_option), default)]
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl NatConfigBuilder {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails if a required field is missing, or see [`NatConfig::validate`].
    pub fn build(&self) -> Result<NatConfig, ConfigError> {
        let config = self.build_unchecked()?;
        config.validate()?;
        Ok(config)
    }
}

impl NatConfig {
    /// Parse and validate a YAML configuration.
    ///
    /// # Errors
    ///
    /// Fails if the document cannot be parsed, or see [`NatConfig::validate`].
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: NatConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system does not constrain.
    ///
    /// # Errors
    ///
    /// Fails if the node address is not unicast, if the probe address belongs to another family,
    /// or if the port range is empty or reaches into reserved ports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let node = self.node_addr;
        let not_unicast = match node {
            IpAddr::V4(ip) => ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast(),
            IpAddr::V6(ip) => ip.is_unspecified() || ip.is_multicast(),
        };
        if not_unicast {
            return Err(ConfigError::InvalidNodeAddr(node));
        }
        if let Some(probe) = self.probe_addr {
            if probe.is_ipv4() != node.is_ipv4() {
                return Err(ConfigError::ProbeFamilyMismatch { probe, node });
            }
        }
        if let Some(range) = self.port_range {
            RangePortProbe::new(range.start, range.end)?;
        }
        Ok(())
    }

    /// The address the OS port probe binds to
    #[must_use]
    pub fn probe_addr(&self) -> IpAddr {
        self.probe_addr.unwrap_or(match self.node_addr {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        })
    }

    #[must_use]
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            close_on_reply: self.close_on_reply,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Build the port probe selected by this configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configured port range is invalid.
    pub fn port_probe(&self) -> Result<DefaultPortProbe, ConfigError> {
        Ok(match self.port_range {
            Some(range) => DefaultPortProbe::Range(RangePortProbe::new(range.start, range.end)?),
            None => DefaultPortProbe::Os(OsPortProbe::new(self.probe_addr())),
        })
    }

    /// Build the port allocator selected by this configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configured port range is invalid.
    pub fn port_allocator(&self) -> Result<PortAllocator<DefaultPortProbe>, ConfigError> {
        Ok(PortAllocator::new(self.port_probe()?, self.max_attempts))
    }

    #[must_use]
    pub fn rewriter(&self) -> PacketRewriter {
        PacketRewriter::new(self.node_addr, self.hop_limit)
    }
}

impl Display for NatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        writeln!(f, "NAT config")?;
        writeln!(f, "  name          : {}", self.name)?;
        writeln!(f, "  device        : {}", self.device)?;
        writeln!(f, "  node address  : {}", self.node_addr)?;
        match self.port_range {
            Some(range) => writeln!(f, "  ports         : {range}")?,
            None => writeln!(f, "  ports         : probed on {}", self.probe_addr())?,
        }
        writeln!(f, "  max attempts  : {}", self.max_attempts)?;
        writeln!(f, "  hop limit     : {}", self.hop_limit)?;
        writeln!(f, "  close on reply: {}", self.close_on_reply)?;
        match self.idle_timeout_secs {
            Some(secs) => writeln!(f, "  idle timeout  : {secs}s"),
            None => writeln!(f, "  idle timeout  : none"),
        }
    }
}
