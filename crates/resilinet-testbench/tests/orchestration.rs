//! End-to-end scenario runs against the in-memory backend
//!
//! These exercise the full phase machine, including failure paths, without
//! needing CAP_NET_ADMIN.

use resilinet_testbench::conformance::packet::{
    build_fragments, build_tcp_segment, build_udp_payload, SegmentSpec, TcpFlags, PROTO_UDP,
};
use async_trait::async_trait;
use resilinet_testbench::conformance::ErrorCategory;
use resilinet_testbench::exchange::ExchangeError;
use resilinet_testbench::memory::OpKind;
use resilinet_testbench::orchestrator::PhaseOutcome;
use resilinet_testbench::pcap::RawPacket;
use resilinet_testbench::{
    Exchange, ExchangeDriver, ExchangeReport, FailureKind, ImpairmentProfile, MemoryNetwork,
    MemoryOrchestrator, Orchestrator, Phase, ScenarioSpec, TestbenchConfig, TestbenchError,
};
use scenarios::{ImpairmentTarget, Presets};
use std::net::Ipv4Addr;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("resilinet_testbench=debug")
        .try_init();
}

fn memory_orchestrator() -> (MemoryNetwork, MemoryOrchestrator) {
    let net = MemoryNetwork::new();
    let orchestrator = MemoryOrchestrator::in_memory(net.clone(), TestbenchConfig::fast());
    (net, orchestrator)
}

fn blackhole() -> ImpairmentProfile {
    ImpairmentProfile::loss("blackhole", 100.0).unwrap()
}

fn phases(report: &resilinet_testbench::ScenarioReport) -> Vec<(Phase, PhaseOutcome)> {
    report.phases.iter().map(|r| (r.phase, r.outcome)).collect()
}

#[tokio::test]
async fn test_handshake_scenario_passes() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let spec = Presets::client_server(Presets::profile("latency").unwrap());

    let report = orchestrator.run(&spec).await.unwrap();

    assert!(report.passed(), "{}", report);
    assert_eq!(report.teardown_runs, 1);
    assert!(report.cleanup_warnings.is_empty());
    assert_eq!(
        phases(&report),
        vec![
            (Phase::Setup, PhaseOutcome::Completed),
            (Phase::Impair, PhaseOutcome::Completed),
            (Phase::Execute, PhaseOutcome::Completed),
            (Phase::Validate, PhaseOutcome::Completed),
            (Phase::Teardown, PhaseOutcome::Completed),
        ]
    );
    assert_eq!(report.events.len(), 3);
    assert!(report.exchange.as_ref().map(|e| e.completed).unwrap_or(false));

    // Nothing left behind
    assert_eq!(net.namespace_count(), 0);
    assert_eq!(net.open_captures(), 0);
    assert_eq!(net.ops_of(OpKind::CloseCapture).len(), 1);
}

#[tokio::test]
async fn test_total_loss_is_handshake_timeout() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let spec = Presets::client_server(blackhole());

    let report = orchestrator.run(&spec).await.unwrap();

    let failure = report.verdict.primary_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::HandshakeTimeout);
    assert_eq!(failure.category(), ErrorCategory::ObservationTimeout);
    assert_eq!(report.teardown_runs, 1);
    assert!(report.ran(Phase::Validate));
    assert_eq!(net.namespace_count(), 0);
}

#[tokio::test]
async fn test_setup_failure_still_tears_down() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    net.fail_on(OpKind::CreateLink, "client");
    let spec = Presets::client_server(Presets::profile("none").unwrap());

    let report = orchestrator.run(&spec).await.unwrap();

    assert_eq!(
        report.verdict.primary_failure().map(|f| f.kind),
        Some(FailureKind::SetupFailed)
    );
    assert_eq!(
        phases(&report),
        vec![
            (Phase::Setup, PhaseOutcome::Failed),
            (Phase::Teardown, PhaseOutcome::Completed),
        ]
    );
    assert_eq!(report.teardown_runs, 1);
    // Both endpoints had been created and both were destroyed
    assert_eq!(net.ops_of(OpKind::Destroy).len(), 2);
    assert_eq!(net.namespace_count(), 0);
}

#[tokio::test]
async fn test_impairment_failure_skips_execution() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    net.fail_on(OpKind::Install, "client");
    let spec = Presets::client_server(Presets::profile("loss").unwrap());

    let report = orchestrator.run(&spec).await.unwrap();

    let failure = report.verdict.primary_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::ImpairmentFailed);
    assert_eq!(failure.category(), ErrorCategory::ResourceError);
    assert!(!report.ran(Phase::Execute));
    assert!(net.ops_of(OpKind::Exchange).is_empty());
    assert_eq!(net.namespace_count(), 0);
}

#[tokio::test]
async fn test_exchange_failure_closes_capture() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    net.fail_on(OpKind::Exchange, "client");
    let spec = Presets::client_server(Presets::profile("none").unwrap());

    let report = orchestrator.run(&spec).await.unwrap();

    assert_eq!(
        report.verdict.primary_failure().map(|f| f.kind),
        Some(FailureKind::ExecuteFailed)
    );
    assert!(!report.ran(Phase::Validate));
    assert_eq!(net.ops_of(OpKind::OpenCapture).len(), 1);
    assert_eq!(net.ops_of(OpKind::CloseCapture).len(), 1);
    assert_eq!(net.open_captures(), 0);
}

/// Ignores its timeout and never finishes
struct StalledDriver;

#[async_trait]
impl ExchangeDriver for StalledDriver {
    async fn execute(
        &self,
        _exchange: &Exchange,
        _timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_stalled_exchange_is_bounded() {
    init_logging();
    let net = MemoryNetwork::new();
    let config = TestbenchConfig::fast();
    let bound = config.observation_window() + config.drive_bound();
    let orchestrator = Orchestrator::new(
        net.clone(),
        net.clone(),
        net.clone(),
        StalledDriver,
        config,
    );
    let spec = Presets::client_server(Presets::profile("none").unwrap());

    let report = tokio::time::timeout(bound * 2, orchestrator.run(&spec))
        .await
        .expect("run finishes once the exchange bound passes")
        .unwrap();

    let failure = report.verdict.primary_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::ExecuteFailed);
    assert!(format!("{:?}", failure.observed).contains("timed out"));
    assert!(!report.ran(Phase::Validate));
    assert_eq!(report.teardown_runs, 1);
    assert_eq!(net.namespace_count(), 0);
    assert_eq!(net.open_captures(), 0);
}

#[tokio::test]
async fn test_cleanup_warning_does_not_change_verdict() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    net.fail_on(OpKind::Destroy, "server");
    let spec = Presets::client_server(Presets::profile("none").unwrap());

    let report = orchestrator.run(&spec).await.unwrap();

    assert!(report.passed());
    assert_eq!(report.cleanup_warnings.len(), 1);
    assert!(report.cleanup_warnings[0].resource.contains("server"));
    assert_eq!(report.teardown_runs, 1);
}

#[tokio::test]
async fn test_second_profile_replaces_first() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let mut spec = Presets::client_server(Presets::profile("latency").unwrap());
    spec.impairments.push(ImpairmentTarget {
        node: "client".to_string(),
        link: 0,
        profile: blackhole(),
    });

    let report = orchestrator.run(&spec).await.unwrap();

    // Only the loss profile is in effect, so the SYN never leaves the client
    assert_eq!(
        report.verdict.primary_failure().map(|f| f.kind),
        Some(FailureKind::HandshakeTimeout)
    );
    assert_eq!(net.ops_of(OpKind::Install).len(), 2);
    // One slot, cleared once
    assert_eq!(net.ops_of(OpKind::Clear).len(), 1);
}

#[tokio::test]
async fn test_fragmentation_scenarios_pass() {
    init_logging();
    for (size, mtu) in [(3000, 1500), (3000, 576), (1000, 1500)] {
        let (net, orchestrator) = memory_orchestrator();
        let report = orchestrator
            .run(&Presets::fragmentation(size, mtu))
            .await
            .unwrap();
        assert!(report.passed(), "{} over mtu {}: {}", size, mtu, report);
        assert_eq!(net.namespace_count(), 0);
    }
}

#[tokio::test]
async fn test_missing_fragment_is_incomplete() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let mut spec = Presets::fragmentation(3000, 1500);
    spec.links[0] = spec.links[0]
        .clone()
        .with_interfaces("orch-frag-s", "orch-frag-r");

    let src = Ipv4Addr::new(10, 0, 1, 1);
    let dst = Ipv4Addr::new(10, 0, 1, 2);
    let payload = build_udp_payload(src, dst, 50000, 9, 3000);
    let packets: Vec<RawPacket> = build_fragments(src, dst, PROTO_UDP, 77, &payload, 1500)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(i, data)| RawPacket::ipv4(Duration::from_millis(i as u64), data))
        .collect();
    net.script_capture("receiver", "orch-frag-r", packets, false);

    let report = orchestrator.run(&spec).await.unwrap();

    assert_eq!(
        report.verdict.primary_failure().map(|f| f.kind),
        Some(FailureKind::ReassemblyIncomplete)
    );
    assert_eq!(report.events.len(), 2);
}

#[tokio::test]
async fn test_out_of_order_capture() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let mut spec = Presets::client_server(Presets::profile("none").unwrap());
    spec.links[0] = spec.links[0]
        .clone()
        .with_interfaces("orch-ooo-c", "orch-ooo-s");

    let client = Ipv4Addr::new(10, 0, 0, 1);
    let server = Ipv4Addr::new(10, 0, 0, 2);
    let segment = |src, dst, sport, dport, seq, ack, flags| {
        RawPacket::ipv4(
            Duration::ZERO,
            build_tcp_segment(&SegmentSpec {
                src,
                dst,
                src_port: sport,
                dst_port: dport,
                seq,
                ack,
                flags,
                id: 1,
            }),
        )
    };
    net.script_capture(
        "server",
        "orch-ooo-s",
        vec![
            segment(server, client, 80, 40000, 500, 101, TcpFlags::SYN | TcpFlags::ACK),
            segment(client, server, 40000, 80, 100, 0, TcpFlags::SYN),
            segment(client, server, 40000, 80, 101, 501, TcpFlags::ACK),
        ],
        false,
    );

    let report = orchestrator.run(&spec).await.unwrap();

    assert_eq!(
        report.verdict.primary_failure().map(|f| f.kind),
        Some(FailureKind::HandshakeOutOfOrder)
    );
}

#[tokio::test]
async fn test_syn_probe() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let report = orchestrator
        .run(&Presets::syn_probe(Presets::profile("none").unwrap()))
        .await
        .unwrap();
    assert!(report.passed(), "{}", report);
    assert!(report.exchange.is_none());
    assert_eq!(net.ops_of(OpKind::SendRaw).len(), 1);

    let (_net, orchestrator) = memory_orchestrator();
    let report = orchestrator
        .run(&Presets::syn_probe(blackhole()))
        .await
        .unwrap();
    let failure = report.verdict.primary_failure().unwrap();
    assert_eq!(failure.assertion, "syn_delivery");
    assert_eq!(failure.kind, FailureKind::ObservationTimeout);
}

#[tokio::test]
async fn test_invalid_scenario_never_starts() {
    init_logging();
    let (net, orchestrator) = memory_orchestrator();
    let mut spec: ScenarioSpec = Presets::client_server(Presets::profile("none").unwrap());
    spec.impairments[0].link = 4;

    let result = orchestrator.run(&spec).await;

    assert!(matches!(result, Err(TestbenchError::Config(_))));
    assert!(net.ops().is_empty());
}

#[tokio::test]
async fn test_report_serializes() {
    init_logging();
    let (_net, orchestrator) = memory_orchestrator();
    let report = orchestrator
        .run(&Presets::client_server(blackhole()))
        .await
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["verdict"]["passed"], false);
    assert_eq!(json["verdict"]["failures"][0]["kind"], "HandshakeTimeout");
    assert_eq!(json["teardown_runs"], 1);
}
