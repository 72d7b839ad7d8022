//! Scenario orchestrator
//!
//! Runs one scenario through `Setup -> Impair -> Execute -> Validate ->
//! Teardown`. A failing phase skips straight to teardown with its failure
//! recorded; teardown runs exactly once whatever happened before it, and its
//! problems are reported as cleanup warnings beside the verdict.

use crate::capture::{CaptureFilter, PacketIo, TcpdumpPacketIo};
use crate::config::TestbenchConfig;
use crate::conformance::packet::{build_tcp_segment, SegmentSpec, TcpFlags, PROTO_TCP, PROTO_UDP};
use crate::conformance::{
    CaptureSession, ConformanceEngine, Evidence, FailureKind, FailureRecord, ProtocolEvent,
    ReplaySource, Verdict,
};
use crate::error::CleanupWarning;
use crate::exchange::{Exchange, ExchangeDriver, ExchangeReport, NetnsExchangeDriver};
use crate::fabric::{Fabric, LinkHandle, LinkRequest, LinkSide};
use crate::impairment::ImpairmentController;
use crate::memory::MemoryNetwork;
use crate::netns::{IpNetnsProvider, NamespaceProvider};
use crate::qdisc::{QdiscController, TcQdiscController};
use crate::TestbenchError;
use scenarios::{ProtocolTest, ScenarioSpec};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Destination port of the fragmentation datagram
pub const FRAGMENT_PORT: u16 = 9;

/// Client port of the injected SYN
const PROBE_SOURCE_PORT: u16 = 40404;
const PROBE_SEQ: u32 = 0x5eed_0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Setup,
    Impair,
    Execute,
    Validate,
    Teardown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PhaseOutcome {
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub elapsed_ms: u64,
}

/// Everything one run produced
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub test: String,
    pub verdict: Verdict,
    /// Advisory; never changes the verdict
    pub cleanup_warnings: Vec<CleanupWarning>,
    /// Phases in the order they ran
    pub phases: Vec<PhaseRecord>,
    pub teardown_runs: u32,
    pub exchange: Option<ExchangeReport>,
    /// Events recorded during Execute
    pub events: Vec<ProtocolEvent>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    pub fn ran(&self, phase: Phase) -> bool {
        self.phases.iter().any(|record| record.phase == phase)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.scenario, self.test, self.verdict)?;
        for warning in &self.cleanup_warnings {
            write!(f, "\n  warning: {}", warning)?;
        }
        Ok(())
    }
}

/// Runs scenarios against one set of collaborators
pub struct Orchestrator<P, Q, X, D> {
    provider: P,
    qdisc: Q,
    io: X,
    driver: Arc<D>,
    config: TestbenchConfig,
}

pub type LinuxOrchestrator =
    Orchestrator<IpNetnsProvider, TcQdiscController, TcpdumpPacketIo, NetnsExchangeDriver>;

pub type MemoryOrchestrator = Orchestrator<MemoryNetwork, MemoryNetwork, MemoryNetwork, MemoryNetwork>;

impl LinuxOrchestrator {
    /// Orchestrator over real namespaces; must be called inside a runtime
    pub fn linux(config: TestbenchConfig) -> Result<Self, TestbenchError> {
        config.validate()?;
        let netns_dir = config.netns_dir.clone();
        Ok(Self::new(
            IpNetnsProvider::new(&netns_dir)?,
            TcQdiscController::new(&netns_dir),
            TcpdumpPacketIo::new(&netns_dir),
            NetnsExchangeDriver::new(&netns_dir),
            config,
        ))
    }
}

impl MemoryOrchestrator {
    pub fn in_memory(net: MemoryNetwork, config: TestbenchConfig) -> Self {
        Self::new(net.clone(), net.clone(), net.clone(), net, config)
    }
}

impl<P, Q, X, D> Orchestrator<P, Q, X, D>
where
    P: NamespaceProvider + Clone + 'static,
    Q: QdiscController + Clone + 'static,
    X: PacketIo + Clone + 'static,
    D: ExchangeDriver + 'static,
{
    pub fn new(provider: P, qdisc: Q, io: X, driver: D, config: TestbenchConfig) -> Self {
        Self {
            provider,
            qdisc,
            io,
            driver: Arc::new(driver),
            config,
        }
    }

    pub fn config(&self) -> &TestbenchConfig {
        &self.config
    }

    /// Run one scenario to completion
    ///
    /// Only an invalid scenario is an error; every other failure is part of
    /// the returned report.
    pub async fn run(&self, spec: &ScenarioSpec) -> Result<ScenarioReport, TestbenchError> {
        spec.validate()?;
        info!("Running scenario {} ({})", spec.name, spec.protocol_test.name());

        let mut run = ScenarioRun {
            spec,
            config: &self.config,
            driver: self.driver.clone(),
            fabric: Fabric::new(self.provider.clone()),
            controller: ImpairmentController::new(self.qdisc.clone()),
            engine: ConformanceEngine::new(self.io.clone(), &self.config),
            links: Vec::new(),
            session: None,
            events: Vec::new(),
            exchange: None,
            verdict: Verdict::pass(),
            warnings: Vec::new(),
            phases: Vec::new(),
            teardown_runs: 0,
        };

        let mut phase = Phase::Setup;
        while phase != Phase::Done {
            let started = Instant::now();
            let (outcome, next) = run.step(phase).await;
            debug!("Phase {} {:?} in {:?}", phase, outcome, started.elapsed());
            run.phases.push(PhaseRecord {
                phase,
                outcome,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            phase = next;
        }

        let report = ScenarioReport {
            scenario: spec.name.clone(),
            test: spec.protocol_test.name().to_string(),
            verdict: run.verdict,
            cleanup_warnings: run.warnings,
            phases: run.phases,
            teardown_runs: run.teardown_runs,
            exchange: run.exchange,
            events: run.events,
        };

        if report.passed() {
            info!("Scenario {} passed", report.scenario);
        } else {
            warn!("Scenario {}: {}", report.scenario, report.verdict);
        }
        Ok(report)
    }
}

/// Per-run state; nothing here outlives one scenario
struct ScenarioRun<'a, P: NamespaceProvider, Q: QdiscController, X: PacketIo, D> {
    spec: &'a ScenarioSpec,
    config: &'a TestbenchConfig,
    driver: Arc<D>,
    fabric: Fabric<P>,
    controller: ImpairmentController<Q>,
    engine: ConformanceEngine<X>,
    links: Vec<LinkHandle>,
    session: Option<CaptureSession>,
    events: Vec<ProtocolEvent>,
    exchange: Option<ExchangeReport>,
    verdict: Verdict,
    warnings: Vec<CleanupWarning>,
    phases: Vec<PhaseRecord>,
    teardown_runs: u32,
}

fn phase_failure(phase: &str, kind: FailureKind, expected: String, error: impl fmt::Display) -> FailureRecord {
    FailureRecord::new(
        phase,
        kind,
        expected,
        Evidence::Error {
            message: error.to_string(),
        },
    )
}

impl<P, Q, X, D> ScenarioRun<'_, P, Q, X, D>
where
    P: NamespaceProvider + Clone + 'static,
    Q: QdiscController + Clone + 'static,
    X: PacketIo + Clone + 'static,
    D: ExchangeDriver + 'static,
{
    async fn step(&mut self, phase: Phase) -> (PhaseOutcome, Phase) {
        let (result, next) = match phase {
            Phase::Setup => (self.setup().await, Phase::Impair),
            Phase::Impair => (self.impair().await, Phase::Execute),
            Phase::Execute => (self.execute().await, Phase::Validate),
            Phase::Validate => (self.validate().await, Phase::Teardown),
            Phase::Teardown => {
                self.teardown().await;
                return (PhaseOutcome::Completed, Phase::Done);
            }
            Phase::Done => return (PhaseOutcome::Completed, Phase::Done),
        };

        match result {
            Ok(()) => (PhaseOutcome::Completed, next),
            Err(failure) => {
                error!("Phase {} failed: {}", phase, failure);
                self.verdict.record(failure);
                (PhaseOutcome::Failed, Phase::Teardown)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), FailureRecord> {
        for node in &self.spec.nodes {
            self.fabric.create_endpoint(&node.name).await.map_err(|e| {
                phase_failure(
                    "setup",
                    FailureKind::SetupFailed,
                    format!("endpoint {} created", node.name),
                    e,
                )
            })?;
        }

        for (index, link) in self.spec.links.iter().enumerate() {
            let handle = self.fabric.link(LinkRequest::from(link)).await.map_err(|e| {
                phase_failure(
                    "setup",
                    FailureKind::SetupFailed,
                    format!("link #{} {} <-> {} up", index, link.a, link.b),
                    e,
                )
            })?;
            self.links.push(handle);
        }

        Ok(())
    }

    async fn impair(&mut self) -> Result<(), FailureRecord> {
        for target in &self.spec.impairments {
            let expected = format!(
                "profile {} applied to {} on link #{}",
                target.profile.name(),
                target.node,
                target.link
            );
            let side = self
                .links
                .get(target.link)
                .and_then(|link| link.side(&target.node))
                .ok_or_else(|| {
                    phase_failure(
                        "impair",
                        FailureKind::ImpairmentFailed,
                        expected.clone(),
                        "link side not built",
                    )
                })?;

            self.controller
                .apply_profile(&self.fabric, &side.endpoint, &side.iface, &target.profile)
                .await
                .map_err(|e| phase_failure("impair", FailureKind::ImpairmentFailed, expected, e))?;
        }

        if !self.spec.impairments.is_empty() && !self.config.settle().is_zero() {
            debug!("Letting impairments settle for {:?}", self.config.settle());
            tokio::time::sleep(self.config.settle()).await;
        }
        Ok(())
    }

    fn test_sides(&self) -> Option<(LinkSide, LinkSide)> {
        let test = &self.spec.protocol_test;
        let link = self.links.get(test.link_index())?;
        Some((
            link.side(test.initiator())?.clone(),
            link.side(test.responder())?.clone(),
        ))
    }

    async fn execute(&mut self) -> Result<(), FailureRecord> {
        let test = self.spec.protocol_test.clone();
        let fail = |expected: &str, e: &dyn fmt::Display| {
            phase_failure("execute", FailureKind::ExecuteFailed, expected.to_string(), e)
        };

        let (initiator, responder) = self
            .test_sides()
            .ok_or_else(|| fail("test link built", &"test link missing"))?;

        let filter = match &test {
            ProtocolTest::TcpHandshake { port, .. } | ProtocolTest::SynProbe { port, .. } => {
                CaptureFilter::between(initiator.addr, responder.addr)
                    .protocol(PROTO_TCP)
                    .port(*port)
            }
            ProtocolTest::Fragmentation { .. } => {
                CaptureFilter::between(initiator.addr, responder.addr).protocol(PROTO_UDP)
            }
        };

        let session = self
            .engine
            .capture(&self.fabric, &responder.endpoint, &responder.iface, filter)
            .await
            .map_err(|e| fail("capture opened on the responder", &e))?;
        let canceller = session.canceller();
        let session = self.session.insert(session);

        let driver = self.driver.clone();
        let io = self.engine.io().clone();
        let exchange_timeout = self.config.exchange_timeout();
        let linger = self.config.linger();
        let deadline = tokio::time::Instant::now() + self.config.drive_bound();
        let mut task = tokio::spawn(async move {
            let result = drive(&test, &initiator, &responder, driver.as_ref(), &io, exchange_timeout).await;
            // Give the tail of the exchange time to reach the capture
            tokio::time::sleep(linger).await;
            canceller.cancel();
            result
        });

        self.events = self.engine.record(session).await;
        debug!("Recorded {} event(s)", self.events.len());

        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                warn!("Exchange still running past its bound, aborted");
                return Err(fail(
                    "protocol exchange ran",
                    &format!("exchange timed out after {:?}", self.config.drive_bound()),
                ));
            }
        };

        match joined {
            Ok(Ok(report)) => {
                if let Some(report) = &report {
                    debug!("Exchange finished: {}", report.detail);
                }
                self.exchange = report;
                Ok(())
            }
            Ok(Err(e)) => Err(fail("protocol exchange ran", &e)),
            Err(e) => Err(fail("protocol exchange ran", &e)),
        }
    }

    async fn validate(&mut self) -> Result<(), FailureRecord> {
        let mut source = ReplaySource::new(self.events.iter().copied());
        let result = match &self.spec.protocol_test {
            ProtocolTest::TcpHandshake { policy, .. } => {
                self.engine.assert_handshake(&mut source, *policy).await
            }
            ProtocolTest::SynProbe { port, .. } => {
                self.engine.assert_syn_delivered(&mut source, *port).await
            }
            ProtocolTest::Fragmentation { payload_size, .. } => {
                let mtu = self
                    .spec
                    .test_link()
                    .map(|link| link.effective_mtu())
                    .unwrap_or(scenarios::link::DEFAULT_MTU);
                self.engine
                    .assert_fragmentation(&mut source, *payload_size, mtu as usize)
                    .await
            }
        };

        if let Err(failure) = result {
            // Assertion failures are data; teardown follows either way
            warn!("Assertion {} failed: {}", failure.assertion, failure);
            self.verdict.record(failure);
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.teardown_runs += 1;

        if let Some(mut session) = self.session.take() {
            if let Err(e) = self.engine.close(&mut session).await {
                warn!("Failed to close capture: {}", e);
                self.warnings.push(CleanupWarning::new(
                    format!("capture on {}:{}", session.endpoint(), session.iface()),
                    e,
                ));
            }
        }

        self.warnings.extend(self.controller.clear_all().await);
        self.warnings.extend(self.fabric.teardown().await);

        if !self.warnings.is_empty() {
            warn!("Teardown finished with {} warning(s)", self.warnings.len());
        }
    }
}

/// Produce the traffic the assertion will look at
async fn drive<D: ExchangeDriver, X: PacketIo>(
    test: &ProtocolTest,
    initiator: &LinkSide,
    responder: &LinkSide,
    driver: &D,
    io: &X,
    timeout: std::time::Duration,
) -> Result<Option<ExchangeReport>, TestbenchError> {
    match test {
        ProtocolTest::TcpHandshake { port, .. } => {
            let exchange = Exchange::TcpConnect {
                client: initiator.endpoint.clone(),
                server: responder.endpoint.clone(),
                target: SocketAddr::new(responder.addr, *port),
            };
            Ok(Some(driver.execute(&exchange, timeout).await?))
        }
        ProtocolTest::Fragmentation { payload_size, .. } => {
            let exchange = Exchange::UdpDatagram {
                sender: initiator.endpoint.clone(),
                receiver: responder.endpoint.clone(),
                target: SocketAddr::new(responder.addr, FRAGMENT_PORT),
                payload_len: *payload_size,
            };
            Ok(Some(driver.execute(&exchange, timeout).await?))
        }
        ProtocolTest::SynProbe { port, .. } => {
            let (IpAddr::V4(src), IpAddr::V4(dst)) = (initiator.addr, responder.addr) else {
                return Err(TestbenchError::InvalidConfig(
                    "SYN probe needs IPv4 addresses".to_string(),
                ));
            };
            let syn = build_tcp_segment(&SegmentSpec {
                src,
                dst,
                src_port: PROBE_SOURCE_PORT,
                dst_port: *port,
                seq: PROBE_SEQ,
                ack: 0,
                flags: TcpFlags::SYN,
                id: 1,
            });
            io.send_raw(&initiator.endpoint, &initiator.iface, &syn).await?;
            Ok(None)
        }
    }
}
