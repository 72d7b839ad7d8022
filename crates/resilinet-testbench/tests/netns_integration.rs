//! Runs against real namespaces
//!
//! Needs root (or CAP_NET_ADMIN) and `ip`, `tc`, `tcpdump` on the PATH:
//! `sudo -E cargo test -p resilinet-testbench --features sudo-tests`

#![cfg(feature = "sudo-tests")]

use resilinet_testbench::fabric::EndpointState;
use resilinet_testbench::{
    Fabric, ImpairmentController, ImpairmentProfile, IpNetnsProvider, LinuxOrchestrator,
    TcQdiscController, TestbenchConfig,
};
use scenarios::Presets;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("resilinet_testbench=debug")
        .try_init();
}

fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[tokio::test]
async fn test_fabric_lifecycle() -> anyhow::Result<()> {
    init_logging();
    let config = TestbenchConfig::from_env();
    let provider = IpNetnsProvider::new(&config.netns_dir)?;
    let mut fabric = Fabric::new(provider);

    fabric.create_endpoint("rn-it-a").await?;
    fabric.create_endpoint("rn-it-b").await?;
    let link = fabric
        .link_endpoints("rn-it-a", "rn-it-b", ip(10, 77, 0, 1), ip(10, 77, 0, 2), 24)
        .await?;

    assert_eq!(fabric.endpoint_state("rn-it-a"), Some(EndpointState::Active));
    assert!(fabric.has_interface("rn-it-b", &link.b.iface));

    let mut impairments = ImpairmentController::new(TcQdiscController::new(&config.netns_dir));
    let profile = ImpairmentProfile::latency(
        "rtt",
        Duration::from_millis(20),
        Some(Duration::from_millis(2)),
    );
    impairments
        .apply_profile(&fabric, "rn-it-a", &link.a.iface, &profile)
        .await?;
    assert_eq!(impairments.installed_count(), 1);

    let warnings = impairments.clear_all().await;
    assert!(warnings.is_empty(), "{:?}", warnings);

    let warnings = fabric.teardown().await;
    assert!(warnings.is_empty(), "{:?}", warnings);
    assert!(!config.netns_dir.join("rn-it-a").exists());

    // A second teardown has nothing left to do
    assert!(fabric.teardown().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_handshake_over_real_namespaces() -> anyhow::Result<()> {
    init_logging();
    let orchestrator = LinuxOrchestrator::linux(TestbenchConfig::from_env())?;
    let mut spec = Presets::client_server(Presets::profile("latency").unwrap());
    spec.name = "netns-handshake".to_string();

    let report = orchestrator.run(&spec).await?;

    assert!(report.passed(), "{}", report);
    assert!(report.cleanup_warnings.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fragmentation_over_real_namespaces() -> anyhow::Result<()> {
    init_logging();
    let orchestrator = LinuxOrchestrator::linux(TestbenchConfig::from_env())?;

    let report = orchestrator.run(&Presets::fragmentation(3000, 1500)).await?;

    assert!(report.passed(), "{}", report);
    Ok(())
}
