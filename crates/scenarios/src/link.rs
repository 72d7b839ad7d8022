//! Topology specifications
//!
//! A scenario topology is a set of named nodes (one isolated endpoint each)
//! and point-to-point links between pairs of them. Each link side carries an
//! address and prefix length, and optionally an explicit interface name.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Default Ethernet MTU used when a link does not set one
pub const DEFAULT_MTU: u32 = 1500;

/// Smallest MTU an IPv4 link may carry
pub const MIN_IPV4_MTU: u32 = 68;

/// A node becomes one isolated endpoint (network namespace)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Point-to-point link between two nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Left node name
    pub a: String,
    /// Right node name
    pub b: String,
    pub addr_a: IpAddr,
    pub addr_b: IpAddr,
    pub prefix_len: u8,
    /// Link MTU applied to both sides; kernel default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Interface name on the left side; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface_a: Option<String>,
    /// Interface name on the right side; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface_b: Option<String>,
}

impl LinkSpec {
    pub fn new(
        a: impl Into<String>,
        b: impl Into<String>,
        addr_a: IpAddr,
        addr_b: IpAddr,
        prefix_len: u8,
    ) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            addr_a,
            addr_b,
            prefix_len,
            mtu: None,
            iface_a: None,
            iface_b: None,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_interfaces(mut self, iface_a: impl Into<String>, iface_b: impl Into<String>) -> Self {
        self.iface_a = Some(iface_a.into());
        self.iface_b = Some(iface_b.into());
        self
    }

    /// Whether `node` is one of the two sides
    pub fn touches(&self, node: &str) -> bool {
        self.a == node || self.b == node
    }

    /// Address assigned on `node`'s side
    pub fn address_of(&self, node: &str) -> Option<IpAddr> {
        if self.a == node {
            Some(self.addr_a)
        } else if self.b == node {
            Some(self.addr_b)
        } else {
            None
        }
    }

    /// MTU the link will carry
    pub fn effective_mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }
}
