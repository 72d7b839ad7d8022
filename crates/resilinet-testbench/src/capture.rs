//! Packet capture and injection
//!
//! [`PacketIo`] is the substrate the conformance engine observes through.
//! The Linux implementation runs `tcpdump` inside the endpoint's namespace
//! and streams its pcap output into a bounded channel; raw injection goes
//! through a `socket2` raw socket created inside the namespace.

use crate::conformance::packet::Ipv4Header;
use crate::error::ResourceError;
use crate::netns::in_namespace;
use crate::pcap::{PcapStream, RawPacket};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IPPROTO_RAW: i32 = 255;

/// Grace period for tcpdump to exit after being killed
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Which packets a capture keeps
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaptureFilter {
    /// Address pair, matched in either direction
    pub hosts: Option<(IpAddr, IpAddr)>,
    /// IP protocol number
    pub protocol: Option<u8>,
    /// Port on either side; implies the first fragment only
    pub port: Option<u16>,
}

impl CaptureFilter {
    /// Everything on the interface
    pub fn any() -> Self {
        Self::default()
    }

    /// Traffic between `a` and `b`
    pub fn between(a: IpAddr, b: IpAddr) -> Self {
        Self {
            hosts: Some((a, b)),
            ..Self::default()
        }
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Equivalent BPF expression for tcpdump
    pub fn to_bpf(&self) -> String {
        let mut terms = Vec::new();
        if let Some((a, b)) = self.hosts {
            terms.push(format!("host {} and host {}", a, b));
        }
        match (self.protocol, self.port) {
            (Some(6), Some(port)) => terms.push(format!("tcp port {}", port)),
            (Some(17), Some(port)) => terms.push(format!("udp port {}", port)),
            (Some(proto), None) => terms.push(format!("ip proto {}", proto)),
            (_, Some(port)) => terms.push(format!("port {}", port)),
            (None, None) => {}
        }
        if terms.is_empty() {
            "ip".to_string()
        } else {
            terms.join(" and ")
        }
    }

    /// Same decision as the BPF expression, applied to a parsed datagram
    pub fn matches(&self, ip: &Ipv4Header, ports: Option<(u16, u16)>) -> bool {
        if let Some((a, b)) = self.hosts {
            let src = IpAddr::V4(ip.src);
            let dst = IpAddr::V4(ip.dst);
            if !((src == a && dst == b) || (src == b && dst == a)) {
                return false;
            }
        }
        if let Some(proto) = self.protocol {
            if ip.protocol != proto {
                return false;
            }
        }
        if let Some(port) = self.port {
            match ports {
                Some((sp, dp)) if ip.fragment_offset == 0 => {
                    if sp != port && dp != port {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

/// An open capture, released with [`PacketIo::close`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureHandle {
    pub id: u64,
    pub endpoint: String,
    pub iface: String,
}

/// Packet capture and injection primitives
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Start capturing on `iface` inside `endpoint`
    ///
    /// Records are pushed into `sink` in capture order; the sender is dropped
    /// when the capture ends, which closes the channel. Returns once the
    /// capture is live.
    async fn open_capture(
        &self,
        endpoint: &str,
        iface: &str,
        filter: &CaptureFilter,
        sink: mpsc::Sender<RawPacket>,
    ) -> Result<CaptureHandle, ResourceError>;

    /// Stop a capture and release its resources
    async fn close(&self, handle: CaptureHandle) -> Result<(), ResourceError>;

    /// Transmit a complete IPv4 datagram out of `iface`
    async fn send_raw(&self, endpoint: &str, iface: &str, packet: &[u8])
        -> Result<(), ResourceError>;
}

struct RunningCapture {
    child: Child,
    reader: JoinHandle<()>,
}

/// Packet I/O through `tcpdump` and raw sockets
#[derive(Clone)]
pub struct TcpdumpPacketIo {
    netns_dir: PathBuf,
    captures: Arc<Mutex<HashMap<u64, RunningCapture>>>,
    next_id: Arc<AtomicU64>,
}

impl TcpdumpPacketIo {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
            captures: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of tcpdump processes currently owned
    pub fn open_count(&self) -> usize {
        self.captures.lock().len()
    }
}

#[async_trait]
impl PacketIo for TcpdumpPacketIo {
    async fn open_capture(
        &self,
        endpoint: &str,
        iface: &str,
        filter: &CaptureFilter,
        sink: mpsc::Sender<RawPacket>,
    ) -> Result<CaptureHandle, ResourceError> {
        let bpf = filter.to_bpf();
        debug!("Starting capture in ns {} on {}: {}", endpoint, iface, bpf);

        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", endpoint, "tcpdump", "-i", iface]);
        cmd.args(["-U", "-n", "-s", "65535", "-w", "-"]);
        cmd.arg(&bpf);
        cmd.env("IP_NETNS_DIR", &self.netns_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResourceError::command("tcpdump", b"stdout not captured"))?;

        // The global header only appears once the interface is open
        let mut stream = match PcapStream::open(stdout).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut stderr = Vec::new();
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut stderr).await;
                }
                let _ = child.wait().await;
                if stderr.is_empty() {
                    stderr = e.to_string().into_bytes();
                }
                return Err(ResourceError::command(
                    format!("tcpdump -i {} (ns {})", iface, endpoint),
                    &stderr,
                ));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}:{}", endpoint, iface);
        let reader = tokio::spawn(async move {
            loop {
                match stream.next_record().await {
                    Ok(Some(packet)) => {
                        if sink.send(packet).await.is_err() {
                            debug!("Capture {} consumer went away", label);
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Capture {} reached end of stream", label);
                        break;
                    }
                    Err(e) => {
                        warn!("Capture {} stream error: {}", label, e);
                        break;
                    }
                }
            }
        });

        self.captures
            .lock()
            .insert(id, RunningCapture { child, reader });

        info!("Capture {} open in ns {} on {}", id, endpoint, iface);
        Ok(CaptureHandle {
            id,
            endpoint: endpoint.to_string(),
            iface: iface.to_string(),
        })
    }

    async fn close(&self, handle: CaptureHandle) -> Result<(), ResourceError> {
        let running = self.captures.lock().remove(&handle.id);
        let Some(mut running) = running else {
            debug!("Capture {} already closed", handle.id);
            return Ok(());
        };

        if let Err(e) = running.child.start_kill() {
            // Exited on its own, e.g. the interface vanished
            debug!("tcpdump for capture {} already gone: {}", handle.id, e);
        }
        match tokio::time::timeout(STOP_TIMEOUT, running.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => warn!("tcpdump for capture {} did not exit in time", handle.id),
        }
        running.reader.abort();

        info!(
            "Capture {} closed in ns {} on {}",
            handle.id, handle.endpoint, handle.iface
        );
        Ok(())
    }

    async fn send_raw(
        &self,
        endpoint: &str,
        iface: &str,
        packet: &[u8],
    ) -> Result<(), ResourceError> {
        let (header, _) = Ipv4Header::parse(packet).ok_or_else(|| {
            ResourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not an IPv4 datagram",
            ))
        })?;
        debug!(
            "Injecting {} bytes {} -> {} in ns {} on {}",
            packet.len(),
            header.src,
            header.dst,
            endpoint,
            iface
        );

        let path = self.netns_dir.join(endpoint);
        let socket = in_namespace(&path, || {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
            socket.bind_device(Some(iface.as_bytes()))?;
            Ok(socket)
        })?;

        let target = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(header.dst, 0)));
        let sent = socket.send_to(packet, &target)?;
        if sent != packet.len() {
            return Err(ResourceError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, packet.len()),
            )));
        }

        info!("Injected {} bytes in ns {} on {}", sent, endpoint, iface);
        Ok(())
    }
}
