//! Preset profiles and scenarios
//!
//! The named profiles match the classic harness settings: `latency` is
//! 100ms with 20ms jitter, `loss` drops 5%, `reorder` reorders 10% behind a
//! 10ms spread, and `none` leaves the link clean.

use crate::error::ConfigError;
use crate::link::{LinkSpec, NodeSpec};
use crate::profile::ImpairmentProfile;
use crate::scenario::{ImpairmentTarget, ProtocolTest, ScenarioSpec, SequencePolicy};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Preset collections for common testing scenarios
pub struct Presets;

impl Presets {
    /// Names accepted by [`Presets::profile`]
    pub const PROFILE_NAMES: [&'static str; 4] = ["latency", "loss", "reorder", "none"];

    /// Look up a named profile
    pub fn profile(name: &str) -> Result<ImpairmentProfile, ConfigError> {
        match name {
            "latency" => Ok(ImpairmentProfile::latency(
                "latency",
                Duration::from_millis(100),
                Some(Duration::from_millis(20)),
            )),
            "loss" => ImpairmentProfile::loss("loss", 5.0),
            "reorder" => ImpairmentProfile::reorder("reorder", 10.0, Some(Duration::from_millis(10))),
            "none" => Ok(ImpairmentProfile::none("none")),
            other => Err(ConfigError::UnsupportedProfile(other.to_string())),
        }
    }

    /// Client 10.0.0.1/24 <-> server 10.0.0.2/24, handshake to port 80, with
    /// `profile` on the client side
    pub fn client_server(profile: ImpairmentProfile) -> ScenarioSpec {
        ScenarioSpec {
            name: format!("client_server_{}", profile.name()),
            description: "TCP handshake between two endpoints over one impaired link".to_string(),
            nodes: vec![NodeSpec::new("client"), NodeSpec::new("server")],
            links: vec![LinkSpec::new(
                "client",
                "server",
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                24,
            )],
            impairments: vec![ImpairmentTarget {
                node: "client".to_string(),
                link: 0,
                profile,
            }],
            protocol_test: ProtocolTest::TcpHandshake {
                client: "client".to_string(),
                server: "server".to_string(),
                link: 0,
                port: 80,
                policy: SequencePolicy::default(),
            },
        }
    }

    /// Same topology, but a crafted SYN is injected and only its delivery checked
    pub fn syn_probe(profile: ImpairmentProfile) -> ScenarioSpec {
        let mut spec = Self::client_server(profile);
        spec.name = format!("syn_probe_{}", spec.impairments[0].profile.name());
        spec.description = "Crafted SYN delivery from client to server".to_string();
        spec.protocol_test = ProtocolTest::SynProbe {
            client: "client".to_string(),
            server: "server".to_string(),
            link: 0,
            port: 80,
        };
        spec
    }

    /// Sender pushes one `payload_size` datagram over a link with `mtu`
    pub fn fragmentation(payload_size: usize, mtu: u32) -> ScenarioSpec {
        ScenarioSpec {
            name: format!("fragmentation_{}_{}", payload_size, mtu),
            description: "Oversized datagram fragmentation and reassembly coverage".to_string(),
            nodes: vec![NodeSpec::new("sender"), NodeSpec::new("receiver")],
            links: vec![LinkSpec::new(
                "sender",
                "receiver",
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)),
                24,
            )
            .with_mtu(mtu)],
            impairments: Vec::new(),
            protocol_test: ProtocolTest::Fragmentation {
                sender: "sender".to_string(),
                receiver: "receiver".to_string(),
                link: 0,
                payload_size,
            },
        }
    }

    /// One handshake scenario per named profile plus a fragmentation check
    pub fn basic_scenarios() -> Vec<ScenarioSpec> {
        let mut scenarios: Vec<ScenarioSpec> = Self::PROFILE_NAMES
            .iter()
            .filter_map(|name| Self::profile(name).ok())
            .map(Self::client_server)
            .collect();
        scenarios.push(Self::fragmentation(3000, 1500));
        scenarios
    }
}
