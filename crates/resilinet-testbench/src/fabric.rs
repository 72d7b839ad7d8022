//! Link fabric
//!
//! Owns the endpoints (namespaces) and links (veth pairs) of one scenario.
//! The fabric keeps its own registry of what it created and only ever tears
//! down those resources, links first, then endpoints, newest first.

use crate::error::{CleanupWarning, ResourceError};
use crate::netns::NamespaceProvider;
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use scenarios::scenario::{is_valid_interface_name, is_valid_node_name};
use scenarios::LinkSpec;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Interface names held by live links anywhere in this process
///
/// veth pairs are created in the host namespace before being moved, so two
/// fabrics must never pick the same name.
static LIVE_INTERFACES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

static NEXT_IFACE: AtomicU32 = AtomicU32::new(0);

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Endpoint name {0} is already in use")]
    DuplicateName(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Address {addr} already assigned in endpoint {endpoint}")]
    AddressConflict { endpoint: String, addr: IpAddr },

    #[error("Interface name {0} is already in use")]
    InterfaceConflict(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Resource operation failed: {0}")]
    Resource(#[from] ResourceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EndpointState {
    Created,
    Active,
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointHandle {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkSide {
    pub endpoint: String,
    pub iface: String,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl LinkSide {
    pub fn network(&self) -> Option<IpNetwork> {
        IpNetwork::new(self.addr, self.prefix_len).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkHandle {
    pub id: u64,
    pub a: LinkSide,
    pub b: LinkSide,
    pub mtu: Option<u32>,
}

impl LinkHandle {
    /// The side of this link bound to `endpoint`
    pub fn side(&self, endpoint: &str) -> Option<&LinkSide> {
        if self.a.endpoint == endpoint {
            Some(&self.a)
        } else if self.b.endpoint == endpoint {
            Some(&self.b)
        } else {
            None
        }
    }

    /// The side facing `endpoint`'s side
    pub fn peer_of(&self, endpoint: &str) -> Option<&LinkSide> {
        if self.a.endpoint == endpoint {
            Some(&self.b)
        } else if self.b.endpoint == endpoint {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Everything needed to build one link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRequest {
    pub a: String,
    pub b: String,
    pub addr_a: IpAddr,
    pub addr_b: IpAddr,
    pub prefix_len: u8,
    pub iface_a: Option<String>,
    pub iface_b: Option<String>,
    pub mtu: Option<u32>,
}

impl From<&LinkSpec> for LinkRequest {
    fn from(spec: &LinkSpec) -> Self {
        Self {
            a: spec.a.clone(),
            b: spec.b.clone(),
            addr_a: spec.addr_a,
            addr_b: spec.addr_b,
            prefix_len: spec.prefix_len,
            iface_a: spec.iface_a.clone(),
            iface_b: spec.iface_b.clone(),
            mtu: spec.mtu,
        }
    }
}

struct EndpointRecord {
    name: String,
    state: EndpointState,
    interfaces: Vec<String>,
    addresses: Vec<IpAddr>,
}

struct LinkRecord {
    handle: LinkHandle,
    torn_down: bool,
}

/// Unique interface name, short enough for IFNAMSIZ
fn generate_iface_name(side: char) -> String {
    let n = NEXT_IFACE.fetch_add(1, Ordering::Relaxed);
    format!(
        "rn{:04x}-{}{}",
        std::process::id() & 0xffff,
        n % 1_000_000,
        side
    )
}

fn reserve_interfaces(names: [&str; 2]) -> Result<(), FabricError> {
    if names[0] == names[1] {
        return Err(FabricError::InterfaceConflict(names[0].to_string()));
    }
    let mut live = LIVE_INTERFACES.lock();
    for name in names {
        if live.contains(name) {
            return Err(FabricError::InterfaceConflict(name.to_string()));
        }
    }
    for name in names {
        live.insert(name.to_string());
    }
    Ok(())
}

fn release_interfaces(names: [&str; 2]) {
    let mut live = LIVE_INTERFACES.lock();
    for name in names {
        live.remove(name);
    }
}

pub struct Fabric<P: NamespaceProvider> {
    provider: P,
    endpoints: Vec<EndpointRecord>,
    links: Vec<LinkRecord>,
    retired: HashSet<String>,
    next_link_id: u64,
}

impl<P: NamespaceProvider> Fabric<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            endpoints: Vec::new(),
            links: Vec::new(),
            retired: HashSet::new(),
            next_link_id: 1,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Provision an isolated endpoint
    ///
    /// Names of endpoints this fabric already destroyed stay retired.
    pub async fn create_endpoint(&mut self, name: &str) -> Result<EndpointHandle, FabricError> {
        if !is_valid_node_name(name) {
            return Err(FabricError::InvalidName(name.to_string()));
        }
        if self.retired.contains(name) || self.find_endpoint(name).is_some() {
            return Err(FabricError::DuplicateName(name.to_string()));
        }

        debug!("Creating endpoint {}", name);
        self.provider.create(name).await?;

        self.endpoints.push(EndpointRecord {
            name: name.to_string(),
            state: EndpointState::Created,
            interfaces: Vec::new(),
            addresses: Vec::new(),
        });
        info!("Created endpoint {}", name);

        Ok(EndpointHandle {
            name: name.to_string(),
        })
    }

    /// Connect two endpoints with generated interface names and the default MTU
    pub async fn link_endpoints(
        &mut self,
        a: &str,
        b: &str,
        addr_a: IpAddr,
        addr_b: IpAddr,
        prefix_len: u8,
    ) -> Result<LinkHandle, FabricError> {
        self.link(LinkRequest {
            a: a.to_string(),
            b: b.to_string(),
            addr_a,
            addr_b,
            prefix_len,
            iface_a: None,
            iface_b: None,
            mtu: None,
        })
        .await
    }

    pub async fn link(&mut self, request: LinkRequest) -> Result<LinkHandle, FabricError> {
        let LinkRequest {
            a,
            b,
            addr_a,
            addr_b,
            prefix_len,
            iface_a,
            iface_b,
            mtu,
        } = request;

        if a == b {
            return Err(FabricError::InvalidName(format!(
                "link from {} to itself",
                a
            )));
        }
        for (endpoint, addr) in [(&a, addr_a), (&b, addr_b)] {
            let record = self
                .find_endpoint(endpoint)
                .ok_or_else(|| FabricError::UnknownEndpoint(endpoint.clone()))?;
            if record.addresses.contains(&addr) {
                return Err(FabricError::AddressConflict {
                    endpoint: endpoint.clone(),
                    addr,
                });
            }
            IpNetwork::new(addr, prefix_len)
                .map_err(|e| FabricError::InvalidAddress(format!("{}/{}: {}", addr, prefix_len, e)))?;
        }

        let iface_a = iface_a.unwrap_or_else(|| generate_iface_name('a'));
        let iface_b = iface_b.unwrap_or_else(|| generate_iface_name('b'));
        for name in [&iface_a, &iface_b] {
            if !is_valid_interface_name(name) {
                return Err(FabricError::InvalidName(name.clone()));
            }
        }
        reserve_interfaces([&iface_a, &iface_b])?;

        debug!(
            "Linking {}:{} <-> {}:{}",
            a, iface_a, b, iface_b
        );
        if let Err(e) = self
            .provider
            .create_virtual_link(&a, &iface_a, &b, &iface_b)
            .await
        {
            release_interfaces([&iface_a, &iface_b]);
            return Err(e.into());
        }

        let handle = LinkHandle {
            id: self.next_link_id,
            a: LinkSide {
                endpoint: a.clone(),
                iface: iface_a.clone(),
                addr: addr_a,
                prefix_len,
            },
            b: LinkSide {
                endpoint: b.clone(),
                iface: iface_b.clone(),
                addr: addr_b,
                prefix_len,
            },
            mtu,
        };
        self.next_link_id += 1;

        // Recorded before configuring so a failure below still tears it down
        self.links.push(LinkRecord {
            handle: handle.clone(),
            torn_down: false,
        });
        for side in [&handle.a, &handle.b] {
            if let Some(record) = self.find_endpoint_mut(&side.endpoint) {
                record.interfaces.push(side.iface.clone());
            }
        }

        for side in [&handle.a, &handle.b] {
            if let Some(mtu) = mtu {
                self.provider.set_mtu(&side.endpoint, &side.iface, mtu).await?;
            }
            self.provider
                .assign_address(&side.endpoint, &side.iface, side.addr, side.prefix_len)
                .await?;
            if let Some(record) = self.find_endpoint_mut(&side.endpoint) {
                record.addresses.push(side.addr);
            }
        }
        for side in [&handle.a, &handle.b] {
            self.provider.set_up(&side.endpoint, &side.iface).await?;
        }
        for side in [&handle.a, &handle.b] {
            if let Some(record) = self.find_endpoint_mut(&side.endpoint) {
                record.state = EndpointState::Active;
            }
        }

        info!(
            "Link {} up: {}:{} ({}) <-> {}:{} ({})",
            handle.id, a, iface_a, addr_a, b, iface_b, addr_b
        );
        Ok(handle)
    }

    /// Whether `iface` belongs to a live endpoint of this fabric
    pub fn has_interface(&self, endpoint: &str, iface: &str) -> bool {
        self.find_endpoint(endpoint)
            .map(|record| record.interfaces.iter().any(|i| i == iface))
            .unwrap_or(false)
    }

    pub fn endpoint_state(&self, name: &str) -> Option<EndpointState> {
        self.endpoints
            .iter()
            .rev()
            .find(|record| record.name == name)
            .map(|record| record.state)
    }

    /// Live links in creation order
    pub fn links(&self) -> impl Iterator<Item = &LinkHandle> {
        self.links
            .iter()
            .filter(|record| !record.torn_down)
            .map(|record| &record.handle)
    }

    pub fn live_endpoints(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|record| record.state != EndpointState::Destroyed)
            .count()
    }

    /// Destroy every link, then every endpoint, newest first
    ///
    /// Failures become warnings and never stop the rest of the teardown.
    /// A second call finds nothing left to do.
    pub async fn teardown(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let provider = &self.provider;

        for record in self.links.iter_mut().rev().filter(|r| !r.torn_down) {
            let link = &record.handle;
            debug!("Removing link {}", link.id);
            match provider
                .destroy_virtual_link(&link.a.endpoint, &link.a.iface)
                .await
            {
                Ok(()) => info!("Removed link {} ({})", link.id, link.a.iface),
                Err(e) if e.is_missing() => debug!("Link {} already gone: {}", link.id, e),
                Err(e) => {
                    warn!("Failed to remove link {}: {}", link.id, e);
                    warnings.push(CleanupWarning::new(
                        format!("link {} ({}:{})", link.id, link.a.endpoint, link.a.iface),
                        e,
                    ));
                }
            }
            release_interfaces([&link.a.iface, &link.b.iface]);
            record.torn_down = true;
        }

        for record in self
            .endpoints
            .iter_mut()
            .rev()
            .filter(|r| r.state != EndpointState::Destroyed)
        {
            debug!("Destroying endpoint {}", record.name);
            match provider.destroy(&record.name).await {
                Ok(()) => info!("Destroyed endpoint {}", record.name),
                Err(e) if e.is_missing() => debug!("Endpoint {} already gone", record.name),
                Err(e) => {
                    warn!("Failed to destroy endpoint {}: {}", record.name, e);
                    warnings.push(CleanupWarning::new(format!("endpoint {}", record.name), e));
                }
            }
            record.state = EndpointState::Destroyed;
            record.interfaces.clear();
            record.addresses.clear();
            self.retired.insert(record.name.clone());
        }

        warnings
    }

    fn find_endpoint(&self, name: &str) -> Option<&EndpointRecord> {
        self.endpoints
            .iter()
            .find(|record| record.name == name && record.state != EndpointState::Destroyed)
    }

    fn find_endpoint_mut(&mut self, name: &str) -> Option<&mut EndpointRecord> {
        self.endpoints
            .iter_mut()
            .find(|record| record.name == name && record.state != EndpointState::Destroyed)
    }
}

impl<P: NamespaceProvider> Drop for Fabric<P> {
    fn drop(&mut self) {
        let live_links = self.links.iter().filter(|r| !r.torn_down).count();
        let live_endpoints = self.live_endpoints();
        if live_links > 0 || live_endpoints > 0 {
            warn!(
                "Fabric dropped with {} link(s) and {} endpoint(s) still live",
                live_links, live_endpoints
            );
            for record in self.links.iter().filter(|r| !r.torn_down) {
                release_interfaces([&record.handle.a.iface, &record.handle.b.iface]);
            }
        }
    }
}
