//! Conformance engine
//!
//! Opens captures on fabric interfaces, turns the raw records into
//! [`ProtocolEvent`]s and runs them through the protocol state machines.
//! Every assertion waits at most one observation window; running out of
//! time is reported as a failure, never as a pass.

pub mod events;
pub mod fragmentation;
pub mod handshake;
pub mod packet;
pub mod session;
pub mod verdict;

pub use events::{EventKind, ProtocolEvent};
pub use fragmentation::{FragmentPlan, FragmentTracker};
pub use handshake::{HandshakeMachine, HandshakeState};
pub use session::{CaptureSession, EventSource, ObservationError, ReplaySource, SessionCanceller};
pub use verdict::{ErrorCategory, Evidence, FailureKind, FailureRecord, Verdict};

use crate::capture::{CaptureFilter, PacketIo};
use crate::config::TestbenchConfig;
use crate::error::ResourceError;
use crate::fabric::Fabric;
use crate::netns::NamespaceProvider;
use scenarios::SequencePolicy;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const SYN_DELIVERY: &str = "syn_delivery";

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface {endpoint}:{iface} is unavailable")]
    InterfaceUnavailable { endpoint: String, iface: String },

    #[error("Capture on {endpoint}:{iface} not live after {waited:?}")]
    NotReady {
        endpoint: String,
        iface: String,
        waited: Duration,
    },

    #[error("Capture failed: {0}")]
    Resource(#[from] ResourceError),
}

pub struct ConformanceEngine<X: PacketIo> {
    io: X,
    window: Duration,
    buffer: usize,
    ready_timeout: Duration,
}

impl<X: PacketIo> ConformanceEngine<X> {
    pub fn new(io: X, config: &TestbenchConfig) -> Self {
        Self {
            io,
            window: config.observation_window(),
            buffer: config.capture_buffer.max(1),
            ready_timeout: config.capture_ready_timeout(),
        }
    }

    pub fn io(&self) -> &X {
        &self.io
    }

    pub fn observation_window(&self) -> Duration {
        self.window
    }

    /// Open a capture on an interface the fabric owns
    pub async fn capture<P: NamespaceProvider>(
        &self,
        fabric: &Fabric<P>,
        endpoint: &str,
        iface: &str,
        filter: CaptureFilter,
    ) -> Result<CaptureSession, CaptureError> {
        let unavailable = || CaptureError::InterfaceUnavailable {
            endpoint: endpoint.to_string(),
            iface: iface.to_string(),
        };

        if !fabric.has_interface(endpoint, iface) {
            return Err(unavailable());
        }

        debug!(
            "Opening capture on {}:{} filter '{}'",
            endpoint,
            iface,
            filter.to_bpf()
        );

        let (tx, rx) = mpsc::channel(self.buffer);
        let opened = tokio::time::timeout(
            self.ready_timeout,
            self.io.open_capture(endpoint, iface, &filter, tx),
        )
        .await
        .map_err(|_| CaptureError::NotReady {
            endpoint: endpoint.to_string(),
            iface: iface.to_string(),
            waited: self.ready_timeout,
        })?;

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) if e.is_missing() => return Err(unavailable()),
            Err(e) => return Err(CaptureError::Resource(e)),
        };

        info!("Capture {} live on {}:{}", handle.id, endpoint, iface);
        Ok(CaptureSession::new(handle, filter, rx))
    }

    /// Release a session's capture; closing twice is a no-op
    pub async fn close(&self, session: &mut CaptureSession) -> Result<(), ResourceError> {
        match session.take_handle() {
            Some(handle) => {
                let id = handle.id;
                self.io.close(handle).await?;
                debug!(
                    "Closed capture {} on {}:{} after {} records",
                    id,
                    session.endpoint(),
                    session.iface(),
                    session.packets_seen()
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn send_raw(&self, endpoint: &str, iface: &str, packet: &[u8]) -> Result<(), ResourceError> {
        self.io.send_raw(endpoint, iface, packet).await
    }

    /// Drain a source until it closes or the window runs out
    pub async fn record<S: EventSource + ?Sized>(&self, source: &mut S) -> Vec<ProtocolEvent> {
        let deadline = Instant::now() + self.window;
        let mut events = Vec::new();
        loop {
            match source.next_event(deadline).await {
                Ok(event) => events.push(event),
                Err(ObservationError::Closed) => break,
                Err(ObservationError::Timeout) => {
                    warn!("Recording stopped by observation window");
                    break;
                }
            }
        }
        events
    }

    /// Wait for `SynSent -> SynAckReceived -> AckSent`
    pub async fn assert_handshake<S: EventSource + ?Sized>(
        &self,
        source: &mut S,
        policy: SequencePolicy,
    ) -> Result<(), FailureRecord> {
        let deadline = Instant::now() + self.window;
        let mut machine = HandshakeMachine::new(policy);

        loop {
            match source.next_event(deadline).await {
                Ok(event) => {
                    if machine.observe(&event)? == HandshakeState::Acked {
                        debug!("Handshake complete after {} events", machine.trace().len());
                        return Ok(());
                    }
                }
                Err(reason) => {
                    debug!("Handshake incomplete: {}", reason);
                    return Err(machine.timeout(self.window_ms()));
                }
            }
        }
    }

    /// Check that a datagram of `original_size` was split correctly for `mtu`
    pub async fn assert_fragmentation<S: EventSource + ?Sized>(
        &self,
        source: &mut S,
        original_size: usize,
        mtu: usize,
    ) -> Result<(), FailureRecord> {
        let deadline = Instant::now() + self.window;
        let plan = FragmentPlan::new(original_size, mtu);
        let mut tracker = FragmentTracker::new();

        while !tracker.is_complete() {
            match source.next_event(deadline).await {
                Ok(event) => {
                    tracker.observe(&event);
                }
                Err(_) => break,
            }
        }

        debug!(
            "Observed {} fragment(s), expecting {}",
            tracker.fragment_count(),
            plan.expected_count()
        );
        tracker.evaluate(&plan, self.window_ms())
    }

    /// Wait for a SYN towards `port`
    pub async fn assert_syn_delivered<S: EventSource + ?Sized>(
        &self,
        source: &mut S,
        port: u16,
    ) -> Result<(), FailureRecord> {
        let deadline = Instant::now() + self.window;
        loop {
            match source.next_event(deadline).await {
                Ok(event) => {
                    if let EventKind::SynSent { dst_port, .. } = event.kind {
                        if dst_port == port {
                            return Ok(());
                        }
                    }
                }
                Err(_) => {
                    return Err(FailureRecord::new(
                        SYN_DELIVERY,
                        FailureKind::ObservationTimeout,
                        format!("SynSent to port {}", port),
                        Evidence::Absent {
                            waited_ms: self.window_ms(),
                            detail: "no SYN reached the capture point".to_string(),
                        },
                    ))
                }
            }
        }
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn engine() -> ConformanceEngine<MemoryNetwork> {
        ConformanceEngine::new(MemoryNetwork::new(), &TestbenchConfig::fast())
    }

    fn event(src: Ipv4Addr, dst: Ipv4Addr, kind: EventKind) -> ProtocolEvent {
        ProtocolEvent {
            at: Duration::ZERO,
            src,
            dst,
            kind,
        }
    }

    fn syn(seq: u32) -> ProtocolEvent {
        event(
            CLIENT,
            SERVER,
            EventKind::SynSent {
                src_port: 40000,
                dst_port: 80,
                seq,
            },
        )
    }

    fn syn_ack(seq: u32, ack: u32) -> ProtocolEvent {
        event(
            SERVER,
            CLIENT,
            EventKind::SynAckReceived {
                src_port: 80,
                dst_port: 40000,
                seq,
                ack,
            },
        )
    }

    fn ack(seq: u32, ack: u32) -> ProtocolEvent {
        event(
            CLIENT,
            SERVER,
            EventKind::AckSent {
                src_port: 40000,
                dst_port: 80,
                seq,
                ack,
            },
        )
    }

    fn fragment(offset: usize, len: usize, more: bool) -> ProtocolEvent {
        event(
            CLIENT,
            SERVER,
            EventKind::FragmentObserved {
                id: 1,
                protocol: 17,
                offset,
                more_fragments: more,
                payload_len: len,
            },
        )
    }

    #[tokio::test]
    async fn test_handshake_passes() {
        let mut source = ReplaySource::new([syn(100), syn_ack(500, 101), ack(101, 501)]);
        let result = engine()
            .assert_handshake(&mut source, SequencePolicy::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_wrong_final_ack() {
        let mut source = ReplaySource::new([syn(100), syn_ack(500, 101), ack(101, 999)]);
        let failure = engine()
            .assert_handshake(&mut source, SequencePolicy::default())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::SequenceNumberMismatch);
        assert_eq!(failure.category(), ErrorCategory::AssertionViolation);
    }

    #[tokio::test]
    async fn test_handshake_out_of_order() {
        let mut source = ReplaySource::new([syn_ack(500, 101), syn(100), ack(101, 501)]);
        let failure = engine()
            .assert_handshake(&mut source, SequencePolicy::default())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::HandshakeOutOfOrder);
    }

    #[tokio::test]
    async fn test_handshake_incomplete_stream() {
        let mut source = ReplaySource::new([syn(100), syn_ack(500, 101)]);
        let failure = engine()
            .assert_handshake(&mut source, SequencePolicy::default())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::HandshakeTimeout);
    }

    #[tokio::test]
    async fn test_fragmentation_passes_and_detects_gap() {
        let complete = [
            fragment(0, 1480, true),
            fragment(1480, 1480, true),
            fragment(2960, 40, false),
        ];
        let engine = engine();

        let mut source = ReplaySource::new(complete);
        assert!(engine.assert_fragmentation(&mut source, 3000, 1500).await.is_ok());

        let mut source = ReplaySource::new([complete[0], complete[2]]);
        let failure = engine
            .assert_fragmentation(&mut source, 3000, 1500)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ReassemblyIncomplete);
    }

    #[tokio::test]
    async fn test_syn_probe_missing() {
        let mut source = ReplaySource::new([syn_ack(1, 2)]);
        let failure = engine()
            .assert_syn_delivered(&mut source, 80)
            .await
            .unwrap_err();
        assert_eq!(failure.assertion, SYN_DELIVERY);
        assert_eq!(failure.kind, FailureKind::ObservationTimeout);
    }

    #[tokio::test]
    async fn test_capture_requires_fabric_interface() {
        let net = MemoryNetwork::new();
        let fabric = Fabric::new(net.clone());
        let engine = ConformanceEngine::new(net, &TestbenchConfig::fast());

        let result = engine
            .capture(&fabric, "nowhere", "veth0", CaptureFilter::any())
            .await;
        assert!(matches!(result, Err(CaptureError::InterfaceUnavailable { .. })));
    }
}
