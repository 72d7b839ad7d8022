//! Network namespace testbench for protocol conformance under impairment
//!
//! This crate builds isolated topologies out of Linux network namespaces and
//! veth pairs, shapes the links with netem, drives a protocol exchange across
//! them and checks the captured packet stream against protocol state
//! machines (TCP handshake sequencing, IPv4 fragmentation coverage).
//!
//! The OS is reached through three narrow collaborator traits
//! ([`NamespaceProvider`], [`QdiscController`], [`PacketIo`]) plus an
//! [`ExchangeDriver`]. Linux implementations shell out to `ip`, `tc` and
//! `tcpdump` and talk rtnetlink; [`memory::MemoryNetwork`] implements all of
//! them in-process for unprivileged runs.

pub mod capture;
pub mod config;
pub mod conformance;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod impairment;
pub mod memory;
pub mod netns;
pub mod orchestrator;
pub mod pcap;
pub mod qdisc;

// Re-export commonly used types
pub use capture::{CaptureFilter, PacketIo, TcpdumpPacketIo};
pub use config::TestbenchConfig;
pub use conformance::{CaptureError, ConformanceEngine, FailureKind, FailureRecord, Verdict};
pub use error::{CleanupWarning, ResourceError};
pub use exchange::{Exchange, ExchangeDriver, ExchangeReport, NetnsExchangeDriver};
pub use fabric::{Fabric, FabricError, LinkHandle};
pub use impairment::{ImpairmentController, ImpairmentError};
pub use memory::MemoryNetwork;
pub use netns::{IpNetnsProvider, NamespaceProvider};
pub use orchestrator::{LinuxOrchestrator, MemoryOrchestrator, Orchestrator, Phase, ScenarioReport};
pub use qdisc::{NetemParams, QdiscController, TcQdiscController};
pub use scenarios::{ImpairmentProfile, LinkSpec, ProtocolTest, ScenarioSpec, SequencePolicy};

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestbenchError {
    #[error("Scenario configuration error: {0}")]
    Config(#[from] scenarios::ConfigError),

    #[error("Testbench configuration error: {0}")]
    ConfigFile(#[from] config::ConfigFileError),

    #[error("Link fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("Impairment error: {0}")]
    Impairment(#[from] ImpairmentError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] exchange::ExchangeError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Load a scenario file and run it against real namespaces
///
/// Needs CAP_NET_ADMIN plus `ip`, `tc` and `tcpdump` on the PATH.
pub async fn run_scenario_file(path: impl AsRef<Path>) -> anyhow::Result<ScenarioReport> {
    let spec = ScenarioSpec::from_path(path.as_ref())?;
    let orchestrator = LinuxOrchestrator::linux(TestbenchConfig::from_env())?;
    let report = orchestrator.run(&spec).await?;
    Ok(report)
}
