//! In-memory network backend
//!
//! [`MemoryNetwork`] implements every collaborator trait against a shared
//! in-process model: namespaces, veth pairs, root disciplines and captures.
//! Packets sent across a pair are delivered to open captures on both ends,
//! so whole scenarios can run without privileges. Every call is logged, and
//! any operation can be made to fail for a given endpoint.
//!
//! Impairments are modelled coarsely: netem delay shifts timestamps and a
//! loss of 100% drops everything leaving the interface. Lower loss rates
//! and reordering are recorded but not simulated.

use crate::capture::{CaptureFilter, CaptureHandle, PacketIo};
use crate::conformance::packet::{
    build_fragments, build_tcp_segment, build_udp_payload, SegmentSpec, TcpFlags, PROTO_UDP,
};
use crate::error::ResourceError;
use crate::exchange::{Exchange, ExchangeDriver, ExchangeError, ExchangeReport};
use crate::netns::NamespaceProvider;
use crate::pcap::RawPacket;
use crate::qdisc::{NetemParams, QdiscController};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_MTU: u32 = 1500;

/// Gap between consecutive packets on the simulated clock
const PACKET_SPACING: Duration = Duration::from_micros(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OpKind {
    Create,
    Destroy,
    CreateLink,
    DestroyLink,
    AssignAddress,
    SetUp,
    SetMtu,
    Install,
    Clear,
    OpenCapture,
    CloseCapture,
    SendRaw,
    Exchange,
}

/// One recorded collaborator call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Op {
    pub kind: OpKind,
    pub endpoint: String,
    pub iface: Option<String>,
}

type IfaceKey = (String, String);

fn key(endpoint: &str, iface: &str) -> IfaceKey {
    (endpoint.to_string(), iface.to_string())
}

struct Interface {
    peer: IfaceKey,
    addresses: Vec<IpAddr>,
    up: bool,
    mtu: u32,
}

struct Capture {
    at: IfaceKey,
    sink: mpsc::Sender<RawPacket>,
}

struct ScriptedCapture {
    packets: Vec<RawPacket>,
    hold_open: bool,
}

#[derive(Default)]
struct State {
    namespaces: HashSet<String>,
    interfaces: HashMap<IfaceKey, Interface>,
    qdiscs: HashMap<IfaceKey, NetemParams>,
    captures: HashMap<u64, Capture>,
    scripted: HashMap<IfaceKey, ScriptedCapture>,
    failures: HashSet<(OpKind, String)>,
    ops: Vec<Op>,
    next_capture: u64,
    next_flow: u32,
    clock: Duration,
}

impl State {
    /// Log the call and fail it if a failure was injected for it
    fn record(&mut self, kind: OpKind, endpoint: &str, iface: Option<&str>) -> Result<(), ResourceError> {
        self.ops.push(Op {
            kind,
            endpoint: endpoint.to_string(),
            iface: iface.map(str::to_string),
        });
        if self.failures.contains(&(kind, endpoint.to_string())) {
            return Err(ResourceError::Injected(format!("{:?} on {}", kind, endpoint)));
        }
        Ok(())
    }

    fn interface_mut(&mut self, endpoint: &str, iface: &str) -> Result<&mut Interface, ResourceError> {
        self.interfaces
            .get_mut(&key(endpoint, iface))
            .ok_or_else(|| ResourceError::InterfaceNotFound(format!("{}:{}", endpoint, iface)))
    }

    fn remove_interface(&mut self, at: &IfaceKey) {
        if let Some(removed) = self.interfaces.remove(at) {
            self.qdiscs.remove(at);
            self.captures.retain(|_, capture| capture.at != *at);
            if self.interfaces.remove(&removed.peer).is_some() {
                self.qdiscs.remove(&removed.peer);
                self.captures.retain(|_, capture| capture.at != removed.peer);
            }
        }
    }

    /// Send `data` out of `from`; false if the egress discipline dropped it
    fn deliver(&mut self, from: &IfaceKey, data: Vec<u8>) -> bool {
        let Some(peer) = self.interfaces.get(from).map(|i| i.peer.clone()) else {
            return false;
        };
        let params = self.qdiscs.get(from).cloned().unwrap_or_default();

        if params.loss_percent.map(|p| p >= 100.0).unwrap_or(false) {
            debug!("Dropped {} bytes leaving {}:{}", data.len(), from.0, from.1);
            return false;
        }

        self.clock += PACKET_SPACING;
        let sent_at = self.clock;
        let arrived_at = sent_at + params.delay.unwrap_or_default();

        for capture in self.captures.values() {
            let at = if capture.at == *from {
                sent_at
            } else if capture.at == peer {
                arrived_at
            } else {
                continue;
            };
            if capture.sink.try_send(RawPacket::ipv4(at, data.clone())).is_err() {
                warn!("Capture on {}:{} full or closed, record lost", capture.at.0, capture.at.1);
            }
        }
        true
    }

    /// Interface in `from` whose peer lives in `to` and owns `addr`
    fn route(&self, from: &str, to: &str, addr: IpAddr) -> Option<(IfaceKey, Ipv4Addr, IfaceKey, Ipv4Addr)> {
        self.interfaces.iter().find_map(|(at, iface)| {
            if at.0 != from || iface.peer.0 != to {
                return None;
            }
            let peer = self.interfaces.get(&iface.peer)?;
            if !peer.addresses.contains(&addr) {
                return None;
            }
            let src = iface.addresses.iter().find_map(|a| match a {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })?;
            let IpAddr::V4(dst) = addr else {
                return None;
            };
            Some((at.clone(), src, iface.peer.clone(), dst))
        })
    }
}

/// Shared in-process network model
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<State>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `kind` call for `endpoint` fail from now on
    pub fn fail_on(&self, kind: OpKind, endpoint: &str) {
        self.state.lock().failures.insert((kind, endpoint.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Serve these records to the next capture opened on `endpoint:iface`
    ///
    /// Unless `hold_open` is set the capture ends once they are delivered.
    pub fn script_capture(&self, endpoint: &str, iface: &str, packets: Vec<RawPacket>, hold_open: bool) {
        self.state
            .lock()
            .scripted
            .insert(key(endpoint, iface), ScriptedCapture { packets, hold_open });
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn ops_of(&self, kind: OpKind) -> Vec<Op> {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.kind == kind)
            .cloned()
            .collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn namespace_count(&self) -> usize {
        self.state.lock().namespaces.len()
    }

    pub fn has_interface(&self, endpoint: &str, iface: &str) -> bool {
        self.state.lock().interfaces.contains_key(&key(endpoint, iface))
    }

    pub fn is_up(&self, endpoint: &str, iface: &str) -> bool {
        self.state
            .lock()
            .interfaces
            .get(&key(endpoint, iface))
            .map(|i| i.up)
            .unwrap_or(false)
    }

    pub fn mtu_of(&self, endpoint: &str, iface: &str) -> Option<u32> {
        self.state
            .lock()
            .interfaces
            .get(&key(endpoint, iface))
            .map(|i| i.mtu)
    }

    pub fn addresses_of(&self, endpoint: &str, iface: &str) -> Vec<IpAddr> {
        self.state
            .lock()
            .interfaces
            .get(&key(endpoint, iface))
            .map(|i| i.addresses.clone())
            .unwrap_or_default()
    }

    /// Discipline currently installed on `endpoint:iface`
    pub fn installed(&self, endpoint: &str, iface: &str) -> Option<NetemParams> {
        self.state.lock().qdiscs.get(&key(endpoint, iface)).cloned()
    }

    pub fn open_captures(&self) -> usize {
        self.state.lock().captures.len()
    }

    fn simulate_connect(
        state: &mut State,
        client: &str,
        server: &str,
        target: SocketAddr,
    ) -> Result<ExchangeReport, ExchangeError> {
        let (client_if, src, server_if, dst) = state
            .route(client, server, target.ip())
            .ok_or_else(|| ResourceError::InterfaceNotFound(format!("{} -> {}", client, target)))?;

        let flow = state.next_flow;
        state.next_flow = state.next_flow.wrapping_add(1);
        let client_port = 40000 + (flow % 20000) as u16;
        let client_isn = 1000u32.wrapping_add(flow.wrapping_mul(7919));
        let server_isn = 5000u32.wrapping_add(flow.wrapping_mul(104729));
        let segment = |src, dst, src_port, dst_port, seq, ack, flags| {
            build_tcp_segment(&SegmentSpec {
                src,
                dst,
                src_port,
                dst_port,
                seq,
                ack,
                flags,
                id: (flow & 0xffff) as u16,
            })
        };

        let syn = segment(src, dst, client_port, target.port(), client_isn, 0, TcpFlags::SYN);
        if !state.deliver(&client_if, syn) {
            return Ok(ExchangeReport::incomplete("SYN dropped"));
        }

        let syn_ack = segment(
            dst,
            src,
            target.port(),
            client_port,
            server_isn,
            client_isn.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
        );
        if !state.deliver(&server_if, syn_ack) {
            return Ok(ExchangeReport::incomplete("SYN-ACK dropped"));
        }

        let ack = segment(
            src,
            dst,
            client_port,
            target.port(),
            client_isn.wrapping_add(1),
            server_isn.wrapping_add(1),
            TcpFlags::ACK,
        );
        if !state.deliver(&client_if, ack) {
            return Ok(ExchangeReport::incomplete("ACK dropped"));
        }

        Ok(ExchangeReport::completed(format!("connected from {}:{}", src, client_port)))
    }

    fn simulate_datagram(
        state: &mut State,
        sender: &str,
        receiver: &str,
        target: SocketAddr,
        payload_len: usize,
    ) -> Result<ExchangeReport, ExchangeError> {
        let (sender_if, src, _, dst) = state
            .route(sender, receiver, target.ip())
            .ok_or_else(|| ResourceError::InterfaceNotFound(format!("{} -> {}", sender, target)))?;
        let mtu = state
            .interfaces
            .get(&sender_if)
            .map(|i| i.mtu)
            .unwrap_or(DEFAULT_MTU) as usize;

        let flow = state.next_flow;
        state.next_flow = state.next_flow.wrapping_add(1);
        let payload = build_udp_payload(src, dst, 50000, target.port(), payload_len);
        let fragments = build_fragments(src, dst, PROTO_UDP, (flow & 0xffff) as u16, &payload, mtu);
        let count = fragments.len();

        let delivered = fragments
            .into_iter()
            .filter(|fragment| state.deliver(&sender_if, fragment.clone()))
            .count();

        if delivered == count {
            Ok(ExchangeReport::completed(format!("{} fragment(s) delivered", count)))
        } else {
            Ok(ExchangeReport::incomplete(format!(
                "{} of {} fragment(s) delivered",
                delivered, count
            )))
        }
    }
}

#[async_trait]
impl NamespaceProvider for MemoryNetwork {
    async fn create(&self, name: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::Create, name, None)?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(ResourceError::command(
                format!("ip netns add {}", name),
                b"Cannot create namespace file: File exists",
            ));
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::Destroy, name, None)?;
        if !state.namespaces.remove(name) {
            return Err(ResourceError::NamespaceNotFound(name.to_string()));
        }
        // Interfaces die with their namespace, and so do their veth peers
        let owned: Vec<IfaceKey> = state
            .interfaces
            .keys()
            .filter(|at| at.0 == name)
            .cloned()
            .collect();
        for at in owned {
            state.remove_interface(&at);
        }
        Ok(())
    }

    async fn create_virtual_link(
        &self,
        ep_a: &str,
        iface_a: &str,
        ep_b: &str,
        iface_b: &str,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::CreateLink, ep_a, Some(iface_a))?;
        for ep in [ep_a, ep_b] {
            if !state.namespaces.contains(ep) {
                return Err(ResourceError::NamespaceNotFound(ep.to_string()));
            }
        }
        let at_a = key(ep_a, iface_a);
        let at_b = key(ep_b, iface_b);
        if state.interfaces.contains_key(&at_a) || state.interfaces.contains_key(&at_b) {
            return Err(ResourceError::command(
                format!("ip link add {} type veth peer name {}", iface_a, iface_b),
                b"RTNETLINK answers: File exists",
            ));
        }
        for (at, peer) in [(at_a.clone(), at_b.clone()), (at_b, at_a)] {
            state.interfaces.insert(
                at,
                Interface {
                    peer,
                    addresses: Vec::new(),
                    up: false,
                    mtu: DEFAULT_MTU,
                },
            );
        }
        Ok(())
    }

    async fn destroy_virtual_link(&self, ep: &str, iface: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::DestroyLink, ep, Some(iface))?;
        let at = key(ep, iface);
        if !state.interfaces.contains_key(&at) {
            return Err(ResourceError::InterfaceNotFound(format!("{}:{}", ep, iface)));
        }
        state.remove_interface(&at);
        Ok(())
    }

    async fn assign_address(
        &self,
        ep: &str,
        iface: &str,
        addr: IpAddr,
        _prefix_len: u8,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::AssignAddress, ep, Some(iface))?;
        state.interface_mut(ep, iface)?.addresses.push(addr);
        Ok(())
    }

    async fn set_up(&self, ep: &str, iface: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::SetUp, ep, Some(iface))?;
        state.interface_mut(ep, iface)?.up = true;
        Ok(())
    }

    async fn set_mtu(&self, ep: &str, iface: &str, mtu: u32) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::SetMtu, ep, Some(iface))?;
        state.interface_mut(ep, iface)?.mtu = mtu;
        Ok(())
    }
}

#[async_trait]
impl QdiscController for MemoryNetwork {
    async fn install(
        &self,
        endpoint: &str,
        iface: &str,
        params: &NetemParams,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::Install, endpoint, Some(iface))?;
        state.interface_mut(endpoint, iface)?;
        state.qdiscs.insert(key(endpoint, iface), params.clone());
        Ok(())
    }

    async fn clear(&self, endpoint: &str, iface: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::Clear, endpoint, Some(iface))?;
        state.interface_mut(endpoint, iface)?;
        state.qdiscs.remove(&key(endpoint, iface));
        Ok(())
    }
}

#[async_trait]
impl PacketIo for MemoryNetwork {
    async fn open_capture(
        &self,
        endpoint: &str,
        iface: &str,
        _filter: &CaptureFilter,
        sink: mpsc::Sender<RawPacket>,
    ) -> Result<CaptureHandle, ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::OpenCapture, endpoint, Some(iface))?;
        state.interface_mut(endpoint, iface)?;

        state.next_capture += 1;
        let handle = CaptureHandle {
            id: state.next_capture,
            endpoint: endpoint.to_string(),
            iface: iface.to_string(),
        };

        let at = key(endpoint, iface);
        match state.scripted.remove(&at) {
            Some(script) => {
                if script.hold_open {
                    // Unbound: keeps the stream open but sees no live traffic
                    state.captures.insert(
                        handle.id,
                        Capture {
                            at: key("", ""),
                            sink: sink.clone(),
                        },
                    );
                }
                tokio::spawn(async move {
                    for packet in script.packets {
                        if sink.send(packet).await.is_err() {
                            break;
                        }
                    }
                });
            }
            None => {
                state.captures.insert(handle.id, Capture { at, sink });
            }
        }

        Ok(handle)
    }

    async fn close(&self, handle: CaptureHandle) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::CloseCapture, &handle.endpoint, Some(&handle.iface))?;
        // Dropping the sender ends the stream
        state.captures.remove(&handle.id);
        Ok(())
    }

    async fn send_raw(&self, endpoint: &str, iface: &str, packet: &[u8]) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record(OpKind::SendRaw, endpoint, Some(iface))?;
        state.interface_mut(endpoint, iface)?;
        if !state.deliver(&key(endpoint, iface), packet.to_vec()) {
            debug!("Injected packet dropped on {}:{}", endpoint, iface);
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeDriver for MemoryNetwork {
    async fn execute(
        &self,
        exchange: &Exchange,
        _timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError> {
        let mut state = self.state.lock();
        match exchange {
            Exchange::TcpConnect {
                client,
                server,
                target,
            } => {
                state.record(OpKind::Exchange, client, None)?;
                Self::simulate_connect(&mut state, client, server, *target)
            }
            Exchange::UdpDatagram {
                sender,
                receiver,
                target,
                payload_len,
            } => {
                state.record(OpKind::Exchange, sender, None)?;
                Self::simulate_datagram(&mut state, sender, receiver, *target, *payload_len)
            }
        }
    }
}
