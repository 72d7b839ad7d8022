//! Scenario specifications
//!
//! A [`ScenarioSpec`] is the whole declarative input of one conformance run:
//! topology, impairments to apply to link sides, and the protocol test with
//! its assertion parameters.

use crate::error::ConfigError;
use crate::link::{LinkSpec, NodeSpec, MIN_IPV4_MTU};
use crate::profile::ImpairmentProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Longest interface name Linux accepts (IFNAMSIZ - 1)
pub const MAX_IFACE_NAME: usize = 15;

/// Largest IPv4 payload a single datagram can carry
pub const MAX_IPV4_PAYLOAD: usize = 65_515;

/// UDP header length; the smallest payload a fragmentation probe can send
pub const UDP_HEADER_LEN: usize = 8;

/// Which side of which link gets which profile
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentTarget {
    /// Node whose side of the link is shaped
    pub node: String,
    /// Index into [`ScenarioSpec::links`]
    #[serde(default)]
    pub link: usize,
    pub profile: ImpairmentProfile,
}

/// How strictly the handshake sequence numbers are checked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencePolicy {
    /// Require SYN-ACK.ack == SYN.seq + 1 and ACK.ack == SYN-ACK.seq + 1
    pub verify_acknowledgements: bool,
    /// Accept a repeated SYN / SYN-ACK carrying the same sequence number
    pub tolerate_retransmissions: bool,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        Self {
            verify_acknowledgements: true,
            tolerate_retransmissions: true,
        }
    }
}

impl SequencePolicy {
    /// Every handshake packet must appear exactly once
    pub fn strict() -> Self {
        Self {
            verify_acknowledgements: true,
            tolerate_retransmissions: false,
        }
    }
}

/// The protocol exchange to drive and the assertion to evaluate on it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum ProtocolTest {
    /// Full TCP three-way handshake from `client` to `server:port`
    TcpHandshake {
        client: String,
        server: String,
        #[serde(default)]
        link: usize,
        port: u16,
        #[serde(default)]
        policy: SequencePolicy,
    },
    /// A crafted SYN injected at `client` must be observed at `server`
    SynProbe {
        client: String,
        server: String,
        #[serde(default)]
        link: usize,
        port: u16,
    },
    /// A datagram with `payload_size` bytes of IP payload must arrive as the
    /// expected set of fragments for the link MTU
    Fragmentation {
        sender: String,
        receiver: String,
        #[serde(default)]
        link: usize,
        payload_size: usize,
    },
}

impl ProtocolTest {
    /// Assertion name used in failure records
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolTest::TcpHandshake { .. } => "tcp_handshake",
            ProtocolTest::SynProbe { .. } => "syn_delivery",
            ProtocolTest::Fragmentation { .. } => "fragmentation",
        }
    }

    pub fn link_index(&self) -> usize {
        match self {
            ProtocolTest::TcpHandshake { link, .. }
            | ProtocolTest::SynProbe { link, .. }
            | ProtocolTest::Fragmentation { link, .. } => *link,
        }
    }

    /// Node that starts the exchange
    pub fn initiator(&self) -> &str {
        match self {
            ProtocolTest::TcpHandshake { client, .. } | ProtocolTest::SynProbe { client, .. } => {
                client
            }
            ProtocolTest::Fragmentation { sender, .. } => sender,
        }
    }

    /// Node whose interface is observed
    pub fn responder(&self) -> &str {
        match self {
            ProtocolTest::TcpHandshake { server, .. } | ProtocolTest::SynProbe { server, .. } => {
                server
            }
            ProtocolTest::Fragmentation { receiver, .. } => receiver,
        }
    }
}

/// Complete declarative description of one scenario run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub impairments: Vec<ImpairmentTarget>,
    pub protocol_test: ProtocolTest,
}

impl ScenarioSpec {
    /// Parse and validate a scenario from JSON text
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let spec: ScenarioSpec = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load and validate a scenario file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Link the protocol test runs over
    pub fn test_link(&self) -> Option<&LinkSpec> {
        self.links.get(self.protocol_test.link_index())
    }

    /// Check the whole scenario for consistency without touching the system
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidTest("scenario name is empty".to_string()));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !is_valid_node_name(&node.name) {
                return Err(ConfigError::UnknownNode(format!(
                    "'{}' is not a valid endpoint name",
                    node.name
                )));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
        }

        let mut ifaces = HashSet::new();
        for (index, link) in self.links.iter().enumerate() {
            self.validate_link(index, link, &names)?;
            for iface in [&link.iface_a, &link.iface_b].into_iter().flatten() {
                if !ifaces.insert(iface.as_str()) {
                    return Err(ConfigError::InvalidLink {
                        index,
                        reason: format!("interface name '{}' used twice", iface),
                    });
                }
            }
        }

        for target in &self.impairments {
            let link = self.links.get(target.link).ok_or_else(|| {
                ConfigError::InvalidTarget(format!("link #{} does not exist", target.link))
            })?;
            if !link.touches(&target.node) {
                return Err(ConfigError::InvalidTarget(format!(
                    "node '{}' is not a side of link #{}",
                    target.node, target.link
                )));
            }
        }

        self.validate_test()
    }

    fn validate_link(
        &self,
        index: usize,
        link: &LinkSpec,
        names: &HashSet<&str>,
    ) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidLink { index, reason };

        for node in [&link.a, &link.b] {
            if !names.contains(node.as_str()) {
                return Err(ConfigError::UnknownNode(node.clone()));
            }
        }
        if link.a == link.b {
            return Err(invalid(format!("both sides are '{}'", link.a)));
        }
        if link.addr_a == link.addr_b {
            return Err(invalid(format!("both sides use {}", link.addr_a)));
        }
        let max_prefix = match (link.addr_a, link.addr_b) {
            (IpAddr::V4(_), IpAddr::V4(_)) => 32,
            (IpAddr::V6(_), IpAddr::V6(_)) => 128,
            _ => return Err(invalid("address families differ".to_string())),
        };
        if link.prefix_len > max_prefix {
            return Err(invalid(format!("prefix length /{} too long", link.prefix_len)));
        }
        if let Some(mtu) = link.mtu {
            if mtu < MIN_IPV4_MTU {
                return Err(invalid(format!("MTU {} below {}", mtu, MIN_IPV4_MTU)));
            }
        }
        for iface in [&link.iface_a, &link.iface_b].into_iter().flatten() {
            if !is_valid_interface_name(iface) {
                return Err(invalid(format!("invalid interface name '{}'", iface)));
            }
        }
        Ok(())
    }

    fn validate_test(&self) -> Result<(), ConfigError> {
        let test = &self.protocol_test;
        let link = self.test_link().ok_or_else(|| {
            ConfigError::InvalidTest(format!("link #{} does not exist", test.link_index()))
        })?;

        let (initiator, responder) = (test.initiator(), test.responder());
        if initiator == responder {
            return Err(ConfigError::InvalidTest(format!(
                "'{}' cannot test against itself",
                initiator
            )));
        }
        for node in [initiator, responder] {
            match link.address_of(node) {
                Some(IpAddr::V4(_)) => {}
                Some(IpAddr::V6(_)) => {
                    return Err(ConfigError::InvalidTest(format!(
                        "{} requires IPv4 addressing",
                        test.name()
                    )))
                }
                None => {
                    return Err(ConfigError::InvalidTest(format!(
                        "node '{}' is not a side of link #{}",
                        node,
                        test.link_index()
                    )))
                }
            }
        }

        match test {
            ProtocolTest::TcpHandshake { port, .. } | ProtocolTest::SynProbe { port, .. } => {
                if *port == 0 {
                    return Err(ConfigError::InvalidTest("port 0 is not connectable".to_string()));
                }
            }
            ProtocolTest::Fragmentation { payload_size, .. } => {
                if !(UDP_HEADER_LEN..=MAX_IPV4_PAYLOAD).contains(payload_size) {
                    return Err(ConfigError::InvalidTest(format!(
                        "payload size {} outside {}..={}",
                        payload_size, UDP_HEADER_LEN, MAX_IPV4_PAYLOAD
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Names end up as files under the netns directory
pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Validate interface name according to Linux rules
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IFACE_NAME
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('-')
}
