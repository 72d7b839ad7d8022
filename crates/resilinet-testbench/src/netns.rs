//! Network namespace provider
//!
//! This module provides the namespace provider interface used by the link
//! fabric, and its Linux implementation: namespaces are created and deleted
//! with `ip netns` under the configured `IP_NETNS_DIR`, while veth pairs,
//! addresses, MTU and link state are driven through rtnetlink handles opened
//! inside the target namespace.

use crate::error::ResourceError;
use async_trait::async_trait;
use futures::TryStreamExt;
use nix::sched::{setns, CloneFlags};
use rtnetlink::{new_connection, Handle};
use std::fs::File;
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Primitives the link fabric needs from the platform
#[async_trait]
pub trait NamespaceProvider: Send + Sync {
    /// Create an isolated endpoint named `name`
    async fn create(&self, name: &str) -> Result<(), ResourceError>;

    /// Destroy the endpoint and every interface left inside it
    async fn destroy(&self, name: &str) -> Result<(), ResourceError>;

    /// Create a virtual wire with `iface_a` in `ep_a` and `iface_b` in `ep_b`
    async fn create_virtual_link(
        &self,
        ep_a: &str,
        iface_a: &str,
        ep_b: &str,
        iface_b: &str,
    ) -> Result<(), ResourceError>;

    /// Delete a virtual wire through one of its ends
    async fn destroy_virtual_link(&self, ep: &str, iface: &str) -> Result<(), ResourceError>;

    async fn assign_address(
        &self,
        ep: &str,
        iface: &str,
        addr: IpAddr,
        prefix_len: u8,
    ) -> Result<(), ResourceError>;

    async fn set_up(&self, ep: &str, iface: &str) -> Result<(), ResourceError>;

    async fn set_mtu(&self, ep: &str, iface: &str, mtu: u32) -> Result<(), ResourceError>;
}

/// RAII guard for namespace entry/exit
///
/// Namespace membership is per thread; the guard must be dropped on the same
/// thread before any `.await`.
pub struct NamespaceGuard {
    original_ns: File,
    current_name: String,
}

impl NamespaceGuard {
    /// Switch the calling thread into the namespace bound at `path`
    pub fn enter(path: &Path) -> Result<Self, ResourceError> {
        let current_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let target = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResourceError::NamespaceNotFound(current_name.clone())
            } else {
                ResourceError::Io(e)
            }
        })?;

        // Save current namespace
        let original_ns = File::open("/proc/self/ns/net")?;

        setns(&target, CloneFlags::CLONE_NEWNET)?;
        debug!("Entered namespace: {}", current_name);

        Ok(Self {
            original_ns,
            current_name,
        })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original_ns, CloneFlags::CLONE_NEWNET) {
            warn!(
                "Failed to restore original namespace from {}: {}",
                self.current_name, e
            );
        } else {
            debug!("Restored original namespace from {}", self.current_name);
        }
    }
}

/// Run a synchronous closure with the calling thread inside `path`'s namespace
///
/// Sockets created inside `f` stay bound to that namespace afterwards.
pub fn in_namespace<F, T>(path: &Path, f: F) -> Result<T, ResourceError>
where
    F: FnOnce() -> Result<T, ResourceError>,
{
    let _guard = NamespaceGuard::enter(path)?;
    f()
}

/// Namespace provider backed by `ip netns` and rtnetlink
#[derive(Clone)]
pub struct IpNetnsProvider {
    /// Netlink handle for the host namespace
    handle: Handle,
    /// Base directory for namespace files
    netns_dir: PathBuf,
}

impl IpNetnsProvider {
    /// Create a provider managing namespaces under `netns_dir`
    pub fn new(netns_dir: impl Into<PathBuf>) -> Result<Self, ResourceError> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);

        Ok(Self {
            handle,
            netns_dir: netns_dir.into(),
        })
    }

    pub fn netns_dir(&self) -> &Path {
        &self.netns_dir
    }

    /// Path of the bind mount backing namespace `name`
    pub fn namespace_path(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }

    async fn ip_netns(&self, args: &[&str]) -> Result<(), ResourceError> {
        let mut cmd = Command::new("ip");
        cmd.arg("netns").args(args);
        cmd.env("IP_NETNS_DIR", &self.netns_dir);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ResourceError::command(
                format!("ip netns {}", args.join(" ")),
                &output.stderr,
            ));
        }
        Ok(())
    }

    /// Open a netlink connection whose socket lives inside namespace `ns`
    fn ns_handle(&self, ns: &str) -> Result<Handle, ResourceError> {
        let path = self.namespace_path(ns);
        let (connection, handle, _) = in_namespace(&path, || Ok(new_connection()?))?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn bring_up_loopback(&self, ns: &str) -> Result<(), ResourceError> {
        let handle = self.ns_handle(ns)?;
        let index = find_interface_index(&handle, "lo").await?;
        handle.link().set(index).up().execute().await?;
        debug!("Loopback up in namespace {}", ns);
        Ok(())
    }

    async fn move_to_namespace(&self, iface: &str, ns: &str) -> Result<(), ResourceError> {
        let index = find_interface_index(&self.handle, iface).await?;
        let ns_file = File::open(self.namespace_path(ns))
            .map_err(|_| ResourceError::NamespaceNotFound(ns.to_string()))?;

        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_file.as_raw_fd())
            .execute()
            .await?;

        debug!("Moved interface {} to namespace {}", iface, ns);
        Ok(())
    }
}

#[async_trait]
impl NamespaceProvider for IpNetnsProvider {
    async fn create(&self, name: &str) -> Result<(), ResourceError> {
        debug!("Creating namespace: {}", name);
        self.ip_netns(&["add", name]).await?;

        if let Err(e) = self.bring_up_loopback(name).await {
            // Leave nothing half-built behind
            let _ = self.ip_netns(&["del", name]).await;
            return Err(e);
        }

        info!("Created namespace: {}", name);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), ResourceError> {
        debug!("Deleting namespace: {}", name);
        if !self.namespace_path(name).exists() {
            return Err(ResourceError::NamespaceNotFound(name.to_string()));
        }

        self.ip_netns(&["del", name]).await?;
        info!("Deleted namespace: {}", name);
        Ok(())
    }

    async fn create_virtual_link(
        &self,
        ep_a: &str,
        iface_a: &str,
        ep_b: &str,
        iface_b: &str,
    ) -> Result<(), ResourceError> {
        debug!(
            "Creating veth pair: {}:{} <-> {}:{}",
            ep_a, iface_a, ep_b, iface_b
        );

        self.handle
            .link()
            .add()
            .veth(iface_a.to_string(), iface_b.to_string())
            .execute()
            .await?;

        let moved = match self.move_to_namespace(iface_a, ep_a).await {
            Ok(()) => self.move_to_namespace(iface_b, ep_b).await,
            Err(e) => Err(e),
        };

        if let Err(e) = moved {
            // Deleting either end removes the pair, wherever it ended up
            if let Ok(index) = find_interface_index(&self.handle, iface_a).await {
                let _ = self.handle.link().del(index).execute().await;
            } else if let Ok(handle) = self.ns_handle(ep_a) {
                if let Ok(index) = find_interface_index(&handle, iface_a).await {
                    let _ = handle.link().del(index).execute().await;
                }
            }
            return Err(e);
        }

        info!(
            "Created veth pair: {}:{} <-> {}:{}",
            ep_a, iface_a, ep_b, iface_b
        );
        Ok(())
    }

    async fn destroy_virtual_link(&self, ep: &str, iface: &str) -> Result<(), ResourceError> {
        debug!("Deleting veth {} in namespace {}", iface, ep);
        let handle = self.ns_handle(ep)?;
        let index = find_interface_index(&handle, iface).await?;
        handle.link().del(index).execute().await?;
        info!("Deleted veth {} in namespace {}", iface, ep);
        Ok(())
    }

    async fn assign_address(
        &self,
        ep: &str,
        iface: &str,
        addr: IpAddr,
        prefix_len: u8,
    ) -> Result<(), ResourceError> {
        debug!(
            "Adding address {}/{} to interface {} in namespace {}",
            addr, prefix_len, iface, ep
        );
        let handle = self.ns_handle(ep)?;
        let index = find_interface_index(&handle, iface).await?;
        handle.address().add(index, addr, prefix_len).execute().await?;
        info!(
            "Added address {}/{} to interface {} in namespace {}",
            addr, prefix_len, iface, ep
        );
        Ok(())
    }

    async fn set_up(&self, ep: &str, iface: &str) -> Result<(), ResourceError> {
        debug!("Bringing interface {} up in namespace {}", iface, ep);
        let handle = self.ns_handle(ep)?;
        let index = find_interface_index(&handle, iface).await?;
        handle.link().set(index).up().execute().await?;
        info!("Interface {} is up in namespace {}", iface, ep);
        Ok(())
    }

    async fn set_mtu(&self, ep: &str, iface: &str, mtu: u32) -> Result<(), ResourceError> {
        debug!("Setting MTU {} for interface {} in namespace {}", mtu, iface, ep);
        let handle = self.ns_handle(ep)?;
        let index = find_interface_index(&handle, iface).await?;
        handle.link().set(index).mtu(mtu).execute().await?;
        info!("Set MTU {} for interface {} in namespace {}", mtu, iface, ep);
        Ok(())
    }
}

/// Find interface index by name
async fn find_interface_index(handle: &Handle, name: &str) -> Result<u32, ResourceError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(ResourceError::InterfaceNotFound(name.to_string())),
        // The kernel answers a lookup of a missing name with ENODEV
        Err(e) if e.to_string().contains("No such device") => {
            Err(ResourceError::InterfaceNotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_missing_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let result = NamespaceGuard::enter(&dir.path().join("absent"));
        assert!(matches!(result, Err(ResourceError::NamespaceNotFound(name)) if name == "absent"));
    }

    #[test]
    fn test_in_namespace_propagates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = in_namespace(&dir.path().join("absent"), || Ok(42));
        assert!(result.unwrap_err().is_missing());
    }

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn test_namespace_lifecycle() -> Result<(), ResourceError> {
        let provider = IpNetnsProvider::new(crate::config::DEFAULT_NETNS_DIR)?;
        let name = format!("rn-unit-{}", std::process::id());

        provider.create(&name).await?;
        assert!(provider.namespace_path(&name).exists());

        // Entering works and returns to the host namespace
        let value = in_namespace(&provider.namespace_path(&name), || Ok(7))?;
        assert_eq!(value, 7);

        provider.destroy(&name).await?;
        assert!(matches!(
            provider.destroy(&name).await,
            Err(ResourceError::NamespaceNotFound(_))
        ));
        Ok(())
    }
}
