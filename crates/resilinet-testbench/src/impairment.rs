//! Impairment controller
//!
//! Translates validated impairment profiles into netem parameters and
//! installs them on fabric interfaces. A new profile on the same interface
//! replaces the previous one; disciplines are never stacked.

use crate::error::{CleanupWarning, ResourceError};
use crate::fabric::Fabric;
use crate::netns::NamespaceProvider;
use crate::qdisc::{NetemParams, QdiscController};
use scenarios::{Impairment, ImpairmentProfile};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delay spread used for reordering when the profile gives none
pub const DEFAULT_REORDER_SPREAD: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ImpairmentError {
    #[error("Unknown interface {endpoint}:{iface}")]
    UnknownInterface { endpoint: String, iface: String },

    #[error("Discipline operation failed: {0}")]
    Resource(#[from] ResourceError),
}

/// Netem parameters for `profile`; `None` means "no discipline"
pub fn translate(profile: &ImpairmentProfile) -> Option<NetemParams> {
    let params = match profile.impairment() {
        Impairment::None => return None,
        Impairment::Latency {
            delay,
            jitter,
            correlation,
        } => NetemParams {
            delay: Some(*delay),
            jitter: *jitter,
            delay_correlation: *correlation,
            ..Default::default()
        },
        Impairment::Loss {
            percent,
            correlation,
        } => NetemParams {
            loss_percent: Some(*percent),
            loss_correlation: *correlation,
            ..Default::default()
        },
        Impairment::Reorder {
            percent,
            spread,
            correlation,
        } => {
            // netem only reorders against delayed traffic
            let spread = spread.unwrap_or_else(|| {
                warn!(
                    "Reorder profile {} has no delay spread, using {:?}",
                    profile.name(),
                    DEFAULT_REORDER_SPREAD
                );
                DEFAULT_REORDER_SPREAD
            });
            NetemParams {
                delay: Some(spread),
                reorder_percent: Some(*percent),
                reorder_correlation: *correlation,
                ..Default::default()
            }
        }
    };
    Some(params)
}

pub struct ImpairmentController<Q: QdiscController> {
    qdisc: Q,
    installed: BTreeMap<(String, String), NetemParams>,
}

impl<Q: QdiscController> ImpairmentController<Q> {
    pub fn new(qdisc: Q) -> Self {
        Self {
            qdisc,
            installed: BTreeMap::new(),
        }
    }

    /// Install `profile` on `endpoint:iface`, replacing whatever was there
    pub async fn apply_profile<P: NamespaceProvider>(
        &mut self,
        fabric: &Fabric<P>,
        endpoint: &str,
        iface: &str,
        profile: &ImpairmentProfile,
    ) -> Result<(), ImpairmentError> {
        check_interface(fabric, endpoint, iface)?;

        let Some(params) = translate(profile) else {
            debug!("Profile {} is empty, clearing {}:{}", profile.name(), endpoint, iface);
            return self.clear(endpoint, iface).await;
        };

        self.qdisc.install(endpoint, iface, &params).await?;
        let key = (endpoint.to_string(), iface.to_string());
        if let Some(previous) = self.installed.insert(key, params) {
            debug!("Replaced {:?} on {}:{}", previous, endpoint, iface);
        }
        info!(
            "Applied {} profile {} to {}:{}",
            profile.kind().as_str(),
            profile.name(),
            endpoint,
            iface
        );
        Ok(())
    }

    /// Remove the discipline from `endpoint:iface`; nothing installed is fine
    pub async fn clear_profile<P: NamespaceProvider>(
        &mut self,
        fabric: &Fabric<P>,
        endpoint: &str,
        iface: &str,
    ) -> Result<(), ImpairmentError> {
        check_interface(fabric, endpoint, iface)?;
        self.clear(endpoint, iface).await
    }

    /// Parameters currently installed on `endpoint:iface`
    pub fn installed(&self, endpoint: &str, iface: &str) -> Option<&NetemParams> {
        self.installed
            .get(&(endpoint.to_string(), iface.to_string()))
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    /// Best-effort removal of everything this controller installed
    pub async fn clear_all(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let installed = std::mem::take(&mut self.installed);

        for (endpoint, iface) in installed.into_keys() {
            match self.qdisc.clear(&endpoint, &iface).await {
                Ok(()) => {}
                // The interface went away with its namespace
                Err(e) if e.is_missing() => debug!("{}:{} already gone", endpoint, iface),
                Err(e) => {
                    warn!("Failed to clear qdisc on {}:{}: {}", endpoint, iface, e);
                    warnings.push(CleanupWarning::new(
                        format!("qdisc {}:{}", endpoint, iface),
                        e,
                    ));
                }
            }
        }

        warnings
    }

    async fn clear(&mut self, endpoint: &str, iface: &str) -> Result<(), ImpairmentError> {
        let key = (endpoint.to_string(), iface.to_string());
        if !self.installed.contains_key(&key) {
            debug!("Nothing installed on {}:{}", endpoint, iface);
            return Ok(());
        }
        self.qdisc.clear(endpoint, iface).await?;
        self.installed.remove(&key);
        info!("Cleared impairment on {}:{}", endpoint, iface);
        Ok(())
    }
}

fn check_interface<P: NamespaceProvider>(
    fabric: &Fabric<P>,
    endpoint: &str,
    iface: &str,
) -> Result<(), ImpairmentError> {
    if fabric.has_interface(endpoint, iface) {
        Ok(())
    } else {
        Err(ImpairmentError::UnknownInterface {
            endpoint: endpoint.to_string(),
            iface: iface.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LinkHandle;
    use crate::memory::{MemoryNetwork, OpKind};
    use crate::qdisc::{quantize_percent, PERCENT_PRECISION};
    use std::net::{IpAddr, Ipv4Addr};

    async fn linked(net: &MemoryNetwork) -> (Fabric<MemoryNetwork>, LinkHandle) {
        let mut fabric = Fabric::new(net.clone());
        fabric.create_endpoint("client").await.unwrap();
        fabric.create_endpoint("server").await.unwrap();
        let link = fabric
            .link_endpoints(
                "client",
                "server",
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                24,
            )
            .await
            .unwrap();
        (fabric, link)
    }

    #[test]
    fn test_translate_kinds() {
        let latency = ImpairmentProfile::latency(
            "lat",
            Duration::from_millis(100),
            Some(Duration::from_millis(20)),
        );
        let params = translate(&latency).unwrap();
        assert_eq!(params.delay, Some(Duration::from_millis(100)));
        assert_eq!(params.jitter, Some(Duration::from_millis(20)));

        let reorder = ImpairmentProfile::reorder("ro", 25.0, None).unwrap();
        let params = translate(&reorder).unwrap();
        assert_eq!(params.reorder_percent, Some(25.0));
        assert_eq!(params.delay, Some(DEFAULT_REORDER_SPREAD));

        assert!(translate(&ImpairmentProfile::none("clean")).is_none());
    }

    #[test]
    fn test_loss_within_precision() {
        for p in [0.0, 0.1, 1.0, 5.0, 12.5, 33.3, 99.99, 100.0] {
            let profile = ImpairmentProfile::loss("loss", p).unwrap();
            let args = translate(&profile).unwrap().to_tc_args();
            let at = args.iter().position(|a| a == "loss").unwrap();
            let emitted: f64 = args[at + 1].trim_end_matches('%').parse().unwrap();
            let applied = quantize_percent(emitted);
            assert!(
                (applied - p).abs() <= PERCENT_PRECISION,
                "{} emitted as {} and applied as {}",
                p,
                args[at + 1],
                applied
            );
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let net = MemoryNetwork::new();
        let (mut fabric, link) = linked(&net).await;
        let mut controller = ImpairmentController::new(net.clone());
        let side = &link.a;

        let first = ImpairmentProfile::latency("lat", Duration::from_millis(50), None);
        let second = ImpairmentProfile::loss("loss", 10.0).unwrap();
        controller
            .apply_profile(&fabric, &side.endpoint, &side.iface, &first)
            .await
            .unwrap();
        controller
            .apply_profile(&fabric, &side.endpoint, &side.iface, &second)
            .await
            .unwrap();

        let expected = translate(&second).unwrap();
        assert_eq!(controller.installed(&side.endpoint, &side.iface), Some(&expected));
        assert_eq!(net.installed(&side.endpoint, &side.iface), Some(expected));
        assert_eq!(controller.installed_count(), 1);

        controller.clear_all().await;
        fabric.teardown().await;
    }

    #[tokio::test]
    async fn test_unknown_interface() {
        let net = MemoryNetwork::new();
        let (mut fabric, _link) = linked(&net).await;
        let mut controller = ImpairmentController::new(net.clone());
        let profile = ImpairmentProfile::loss("loss", 1.0).unwrap();

        let result = controller
            .apply_profile(&fabric, "client", "eth9", &profile)
            .await;
        assert!(matches!(result, Err(ImpairmentError::UnknownInterface { .. })));
        assert!(net.ops_of(OpKind::Install).is_empty());

        fabric.teardown().await;
    }

    #[tokio::test]
    async fn test_clear_without_install_is_noop() {
        let net = MemoryNetwork::new();
        let (mut fabric, link) = linked(&net).await;
        let mut controller = ImpairmentController::new(net.clone());

        controller
            .clear_profile(&fabric, &link.b.endpoint, &link.b.iface)
            .await
            .unwrap();
        assert!(net.ops_of(OpKind::Clear).is_empty());

        let profile = ImpairmentProfile::loss("loss", 1.0).unwrap();
        controller
            .apply_profile(&fabric, &link.b.endpoint, &link.b.iface, &profile)
            .await
            .unwrap();
        controller
            .clear_profile(&fabric, &link.b.endpoint, &link.b.iface)
            .await
            .unwrap();
        assert_eq!(net.installed(&link.b.endpoint, &link.b.iface), None);
        assert!(controller.clear_all().await.is_empty());

        fabric.teardown().await;
    }

    #[tokio::test]
    async fn test_clear_all_collects_warnings() {
        let net = MemoryNetwork::new();
        let (mut fabric, link) = linked(&net).await;
        let mut controller = ImpairmentController::new(net.clone());
        let profile = ImpairmentProfile::loss("loss", 1.0).unwrap();
        controller
            .apply_profile(&fabric, &link.a.endpoint, &link.a.iface, &profile)
            .await
            .unwrap();

        net.fail_on(OpKind::Clear, "client");
        let warnings = controller.clear_all().await;
        assert_eq!(warnings.len(), 1);
        assert_eq!(controller.installed_count(), 0);

        fabric.teardown().await;
    }
}
