//! TCP three-way handshake state machine
//!
//! `Idle -> SynSeen -> SynAckSeen -> Acked`. The machine is fed events in
//! capture order and stops at `Acked` or at the first violation.

use super::events::{EventKind, ProtocolEvent};
use super::verdict::{Evidence, FailureKind, FailureRecord};
use scenarios::SequencePolicy;
use std::net::Ipv4Addr;

pub const ASSERTION: &str = "tcp_handshake";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Flow {
    client: Ipv4Addr,
    server: Ipv4Addr,
    client_port: u16,
    server_port: u16,
}

impl Flow {
    fn is_reply(&self, event: &ProtocolEvent, src_port: u16, dst_port: u16) -> bool {
        event.src == self.server
            && event.dst == self.client
            && src_port == self.server_port
            && dst_port == self.client_port
    }

    fn is_forward(&self, event: &ProtocolEvent, src_port: u16, dst_port: u16) -> bool {
        event.src == self.client
            && event.dst == self.server
            && src_port == self.client_port
            && dst_port == self.server_port
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    SynSeen { syn_seq: u32 },
    SynAckSeen { syn_seq: u32, syn_ack_seq: u32 },
    Acked,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::SynSeen { .. } => "SynSeen",
            HandshakeState::SynAckSeen { .. } => "SynAckSeen",
            HandshakeState::Acked => "Acked",
        }
    }
}

pub struct HandshakeMachine {
    policy: SequencePolicy,
    state: HandshakeState,
    flow: Option<Flow>,
    trace: Vec<ProtocolEvent>,
}

impl HandshakeMachine {
    pub fn new(policy: SequencePolicy) -> Self {
        Self {
            policy,
            state: HandshakeState::Idle,
            flow: None,
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Acked
    }

    /// Handshake events consumed so far
    pub fn trace(&self) -> &[ProtocolEvent] {
        &self.trace
    }

    /// Feed one event; an error is terminal
    pub fn observe(&mut self, event: &ProtocolEvent) -> Result<HandshakeState, FailureRecord> {
        let next = match (self.state, event.kind) {
            (HandshakeState::Acked, _) => return Ok(self.state),

            (HandshakeState::Idle, EventKind::SynSent { src_port, dst_port, seq }) => {
                self.flow = Some(Flow {
                    client: event.src,
                    server: event.dst,
                    client_port: src_port,
                    server_port: dst_port,
                });
                HandshakeState::SynSeen { syn_seq: seq }
            }
            (HandshakeState::Idle, EventKind::SynAckReceived { .. })
            | (HandshakeState::Idle, EventKind::AckSent { .. }) => {
                return Err(self.out_of_order(event, "SynSent first"));
            }

            (HandshakeState::SynSeen { syn_seq }, EventKind::SynSent { src_port, dst_port, seq }) => {
                if !self.is_forward(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                if self.policy.tolerate_retransmissions && seq == syn_seq {
                    self.trace.push(*event);
                    return Ok(self.state);
                }
                return Err(self.out_of_order(event, "SynAckReceived after SynSent"));
            }
            (
                HandshakeState::SynSeen { syn_seq },
                EventKind::SynAckReceived { src_port, dst_port, seq, ack },
            ) => {
                if !self.is_reply(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                let expected = syn_seq.wrapping_add(1);
                if self.policy.verify_acknowledgements && ack != expected {
                    return Err(self.mismatch(event, format!("SYN-ACK ack={} (SYN seq + 1)", expected)));
                }
                HandshakeState::SynAckSeen {
                    syn_seq,
                    syn_ack_seq: seq,
                }
            }
            (HandshakeState::SynSeen { .. }, EventKind::AckSent { src_port, dst_port, .. }) => {
                if !self.is_forward(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                return Err(self.out_of_order(event, "SynAckReceived before AckSent"));
            }

            (
                HandshakeState::SynAckSeen { syn_seq, syn_ack_seq },
                EventKind::AckSent { src_port, dst_port, seq, ack },
            ) => {
                if !self.is_forward(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                if self.policy.verify_acknowledgements {
                    let expected_ack = syn_ack_seq.wrapping_add(1);
                    if ack != expected_ack {
                        return Err(self.mismatch(
                            event,
                            format!("ACK ack={} (SYN-ACK seq + 1)", expected_ack),
                        ));
                    }
                    let expected_seq = syn_seq.wrapping_add(1);
                    if seq != expected_seq {
                        return Err(self.mismatch(
                            event,
                            format!("ACK seq={} (SYN seq + 1)", expected_seq),
                        ));
                    }
                }
                HandshakeState::Acked
            }
            (
                HandshakeState::SynAckSeen { syn_ack_seq, .. },
                EventKind::SynAckReceived { src_port, dst_port, seq, .. },
            ) => {
                if !self.is_reply(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                if self.policy.tolerate_retransmissions && seq == syn_ack_seq {
                    self.trace.push(*event);
                    return Ok(self.state);
                }
                return Err(self.out_of_order(event, "AckSent after SynAckReceived"));
            }
            (HandshakeState::SynAckSeen { syn_seq, .. }, EventKind::SynSent { src_port, dst_port, seq }) => {
                if !self.is_forward(event, src_port, dst_port) {
                    return Ok(self.state);
                }
                // The SYN-ACK may have been lost past the capture point
                if self.policy.tolerate_retransmissions && seq == syn_seq {
                    self.trace.push(*event);
                    return Ok(self.state);
                }
                return Err(self.out_of_order(event, "AckSent after SynAckReceived"));
            }

            (_, EventKind::FragmentObserved { .. }) | (_, EventKind::Other { .. }) => {
                return Ok(self.state)
            }
        };

        self.trace.push(*event);
        self.state = next;
        Ok(next)
    }

    /// Failure for a stream that ended before `Acked`
    pub fn timeout(&self, waited_ms: u64) -> FailureRecord {
        let detail = format!("handshake stopped in state {}", self.state.name());
        let observed = if self.trace.is_empty() {
            Evidence::Absent { waited_ms, detail }
        } else {
            Evidence::Events {
                events: self.trace.clone(),
            }
        };
        FailureRecord::new(
            ASSERTION,
            FailureKind::HandshakeTimeout,
            format!(
                "SynSent -> SynAckReceived -> AckSent within {}ms (stopped in {})",
                waited_ms,
                self.state.name()
            ),
            observed,
        )
    }

    fn is_forward(&self, event: &ProtocolEvent, src_port: u16, dst_port: u16) -> bool {
        self.flow
            .map(|f| f.is_forward(event, src_port, dst_port))
            .unwrap_or(true)
    }

    fn is_reply(&self, event: &ProtocolEvent, src_port: u16, dst_port: u16) -> bool {
        self.flow
            .map(|f| f.is_reply(event, src_port, dst_port))
            .unwrap_or(true)
    }

    fn out_of_order(&self, event: &ProtocolEvent, expected: &str) -> FailureRecord {
        FailureRecord::new(
            ASSERTION,
            FailureKind::HandshakeOutOfOrder,
            format!("{} (in state {})", expected, self.state.name()),
            Evidence::Event { event: *event },
        )
    }

    fn mismatch(&self, event: &ProtocolEvent, expected: String) -> FailureRecord {
        FailureRecord::new(
            ASSERTION,
            FailureKind::SequenceNumberMismatch,
            expected,
            Evidence::Event { event: *event },
        )
    }
}
