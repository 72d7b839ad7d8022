//! Protocol exchanges driven across a link
//!
//! The exchange is the traffic under test: a TCP connection attempt for the
//! handshake assertion or a single oversized UDP datagram for the
//! fragmentation assertion. Sockets are created inside the endpoint's
//! namespace and then handed to tokio.

use crate::error::ResourceError;
use crate::netns::in_namespace;
use async_trait::async_trait;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tracing::{debug, info, warn};

const UDP_HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Exchange setup failed: {0}")]
    Resource(#[from] ResourceError),

    #[error("Exchange I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exchange {
    /// `client` connects to a listener `server` opens on `target`
    TcpConnect {
        client: String,
        server: String,
        target: SocketAddr,
    },
    /// `sender` sends one datagram of `payload_len` bytes (UDP header
    /// included) to a socket `receiver` binds on `target`
    UdpDatagram {
        sender: String,
        receiver: String,
        target: SocketAddr,
        payload_len: usize,
    },
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::TcpConnect { .. } => "tcp_connect",
            Exchange::UdpDatagram { .. } => "udp_datagram",
        }
    }
}

/// What the driving side saw; the capture is the authority on conformance
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExchangeReport {
    pub completed: bool,
    pub detail: String,
}

impl ExchangeReport {
    pub fn completed(detail: impl Into<String>) -> Self {
        Self {
            completed: true,
            detail: detail.into(),
        }
    }

    pub fn incomplete(detail: impl Into<String>) -> Self {
        Self {
            completed: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ExchangeDriver: Send + Sync {
    /// Run `exchange`, giving up after `timeout`
    ///
    /// A peer that never answers is an incomplete report, not an error;
    /// errors are reserved for sockets that could not be set up.
    async fn execute(
        &self,
        exchange: &Exchange,
        timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError>;
}

/// Runs exchanges between real namespaces
#[derive(Clone, Debug)]
pub struct NetnsExchangeDriver {
    netns_dir: PathBuf,
}

impl NetnsExchangeDriver {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
        }
    }

    fn socket_in(
        &self,
        endpoint: &str,
        ty: Type,
        protocol: Protocol,
        bind: Option<SocketAddr>,
    ) -> Result<Socket, ResourceError> {
        in_namespace(&self.netns_dir.join(endpoint), || {
            let socket = Socket::new(Domain::IPV4, ty, Some(protocol))?;
            if let Some(addr) = bind {
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(addr))?;
            }
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
    }

    async fn tcp_connect(
        &self,
        client: &str,
        server: &str,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError> {
        let listener = self.socket_in(server, Type::STREAM, Protocol::TCP, Some(target))?;
        listener.listen(16)?;
        let listener = TcpListener::from_std(listener.into())?;
        debug!("Listening on {} in ns {}", target, server);

        let accept = tokio::spawn(async move {
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(Ok((_stream, peer))) => Some(peer),
                _ => None,
            }
        });

        let socket = self.socket_in(client, Type::STREAM, Protocol::TCP, None)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        let report = match tokio::time::timeout(timeout, socket.connect(target)).await {
            Ok(Ok(stream)) => {
                let local = stream.local_addr()?;
                info!("Connected {} -> {} from ns {}", local, target, client);
                ExchangeReport::completed(format!("connected from {}", local))
            }
            Ok(Err(e)) => {
                warn!("Connect to {} from ns {} failed: {}", target, client, e);
                ExchangeReport::incomplete(format!("connect failed: {}", e))
            }
            Err(_) => {
                warn!("Connect to {} from ns {} timed out", target, client);
                ExchangeReport::incomplete(format!("connect timed out after {:?}", timeout))
            }
        };

        if report.completed {
            // The server side is not part of the verdict; just don't leak it
            if let Ok(Some(peer)) = accept.await {
                debug!("Accepted {} in ns {}", peer, server);
            }
        } else {
            accept.abort();
        }

        Ok(report)
    }

    async fn udp_datagram(
        &self,
        sender: &str,
        receiver: &str,
        target: SocketAddr,
        payload_len: usize,
        timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError> {
        let data_len = payload_len.saturating_sub(UDP_HEADER_LEN);

        let rx = self.socket_in(receiver, Type::DGRAM, Protocol::UDP, Some(target))?;
        let rx = UdpSocket::from_std(rx.into())?;

        let tx = self.socket_in(sender, Type::DGRAM, Protocol::UDP, None)?;
        let tx = UdpSocket::from_std(tx.into())?;

        let data: Vec<u8> = (0..data_len).map(|i| (i % 251) as u8).collect();
        let sent = tx.send_to(&data, target).await?;
        debug!("Sent {} byte datagram to {} from ns {}", sent, target, sender);

        let mut buf = vec![0u8; data_len.max(1) + 1];
        let report = match tokio::time::timeout(timeout, rx.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if len == data_len => {
                info!("Datagram of {} bytes from {} reassembled in ns {}", len, from, receiver);
                ExchangeReport::completed(format!("received {} bytes", len))
            }
            Ok(Ok((len, _))) => ExchangeReport::incomplete(format!(
                "received {} of {} bytes",
                len, data_len
            )),
            Ok(Err(e)) => ExchangeReport::incomplete(format!("receive failed: {}", e)),
            Err(_) => ExchangeReport::incomplete(format!("nothing received after {:?}", timeout)),
        };

        Ok(report)
    }
}

#[async_trait]
impl ExchangeDriver for NetnsExchangeDriver {
    async fn execute(
        &self,
        exchange: &Exchange,
        timeout: Duration,
    ) -> Result<ExchangeReport, ExchangeError> {
        debug!("Running exchange {:?}", exchange);
        match exchange {
            Exchange::TcpConnect {
                client,
                server,
                target,
            } => self.tcp_connect(client, server, *target, timeout).await,
            Exchange::UdpDatagram {
                sender,
                receiver,
                target,
                payload_len,
            } => {
                self.udp_datagram(sender, receiver, *target, *payload_len, timeout)
                    .await
            }
        }
    }
}
