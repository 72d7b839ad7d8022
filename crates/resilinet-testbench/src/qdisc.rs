//! Traffic control (qdisc) management
//!
//! This module holds the netem parameter set produced by profile
//! translation, the controller interface that installs and removes it, and a
//! Linux controller that shells out to `tc` inside the target namespace.

use crate::error::ResourceError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Resolution of a netem percentage: the kernel stores probabilities as a
/// fraction of `u32::MAX`
pub const PERCENT_PRECISION: f64 = 100.0 / u32::MAX as f64;

/// Network emulation (netem) configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NetemParams {
    /// Base delay applied to every packet
    pub delay: Option<Duration>,
    /// Random variation around `delay`
    pub jitter: Option<Duration>,
    /// Correlation of successive jitter values (0-100)
    pub delay_correlation: Option<f64>,
    /// Drop probability (0-100)
    pub loss_percent: Option<f64>,
    pub loss_correlation: Option<f64>,
    /// Share of packets sent immediately, ahead of the delayed ones (0-100)
    pub reorder_percent: Option<f64>,
    pub reorder_correlation: Option<f64>,
}

impl NetemParams {
    /// Whether installing these parameters would change anything
    pub fn is_noop(&self) -> bool {
        self.delay.is_none() && self.loss_percent.is_none() && self.reorder_percent.is_none()
    }

    /// Drop probability as the kernel will apply it
    pub fn effective_loss(&self) -> Option<f64> {
        self.loss_percent.map(quantize_percent)
    }

    /// Arguments following `tc qdisc replace dev <if> root netem`
    pub fn to_tc_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(delay) = self.delay {
            args.push("delay".to_string());
            args.push(format_tc_time(delay));
            if let Some(jitter) = self.jitter.filter(|j| !j.is_zero()) {
                args.push(format_tc_time(jitter));
                if let Some(corr) = self.delay_correlation {
                    args.push(format!("{}%", corr));
                }
            }
        }

        if let Some(loss) = self.loss_percent {
            args.push("loss".to_string());
            args.push(format!("{}%", loss));
            if let Some(corr) = self.loss_correlation {
                args.push(format!("{}%", corr));
            }
        }

        if let Some(reorder) = self.reorder_percent {
            args.push("reorder".to_string());
            args.push(format!("{}%", reorder));
            if let Some(corr) = self.reorder_correlation {
                args.push(format!("{}%", corr));
            }
        }

        args
    }
}

/// Round a percentage to what netem can represent
pub fn quantize_percent(percent: f64) -> f64 {
    let clamped = percent.clamp(0.0, 100.0);
    let raw = (clamped / 100.0 * u32::MAX as f64).round();
    raw / u32::MAX as f64 * 100.0
}

fn format_tc_time(duration: Duration) -> String {
    let us = duration.as_micros();
    if us % 1000 == 0 {
        format!("{}ms", us / 1000)
    } else {
        format!("{}us", us)
    }
}

/// Installs and removes the root discipline of an interface
#[async_trait]
pub trait QdiscController: Send + Sync {
    /// Install `params` as the root discipline, replacing whatever is there
    async fn install(
        &self,
        endpoint: &str,
        iface: &str,
        params: &NetemParams,
    ) -> Result<(), ResourceError>;

    /// Remove the root discipline; succeeds when there is none
    async fn clear(&self, endpoint: &str, iface: &str) -> Result<(), ResourceError>;
}

/// Qdisc controller running `tc` through `ip netns exec`
#[derive(Clone, Debug)]
pub struct TcQdiscController {
    netns_dir: PathBuf,
}

impl TcQdiscController {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
        }
    }

    fn tc(&self, endpoint: &str) -> Command {
        let mut cmd = Command::new("ip");
        cmd.arg("netns").arg("exec").arg(endpoint).arg("tc");
        // Ensure ip uses the same netns directory as the namespace provider
        cmd.env("IP_NETNS_DIR", &self.netns_dir);
        cmd
    }
}

#[async_trait]
impl QdiscController for TcQdiscController {
    async fn install(
        &self,
        endpoint: &str,
        iface: &str,
        params: &NetemParams,
    ) -> Result<(), ResourceError> {
        let args = params.to_tc_args();
        debug!("Installing netem in ns {} on {}: {:?}", endpoint, iface, args);

        let mut cmd = self.tc(endpoint);
        cmd.args(["qdisc", "replace", "dev", iface, "root", "netem"]);
        cmd.args(&args);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ResourceError::command(
                format!("tc qdisc replace dev {} root netem {}", iface, args.join(" ")),
                &output.stderr,
            ));
        }

        info!("Netem configured in ns {} on {} ({})", endpoint, iface, args.join(" "));
        Ok(())
    }

    async fn clear(&self, endpoint: &str, iface: &str) -> Result<(), ResourceError> {
        debug!("Removing root qdisc in ns {} on {}", endpoint, iface);

        let mut cmd = self.tc(endpoint);
        cmd.args(["qdisc", "del", "dev", iface, "root"]);

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Deleting the default (handle 0) discipline means nothing was installed
            if stderr.contains("handle of zero") || stderr.contains("No such file or directory") {
                debug!("No qdisc installed in ns {} on {}", endpoint, iface);
                return Ok(());
            }
            return Err(ResourceError::command(
                format!("tc qdisc del dev {} root", iface),
                &output.stderr,
            ));
        }

        info!("Removed root qdisc in ns {} on {}", endpoint, iface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_args() {
        let params = NetemParams {
            delay: Some(Duration::from_millis(100)),
            jitter: Some(Duration::from_millis(20)),
            delay_correlation: Some(25.0),
            ..Default::default()
        };
        assert_eq!(params.to_tc_args(), vec!["delay", "100ms", "20ms", "25%"]);
    }

    #[test]
    fn test_reorder_args_carry_delay() {
        let params = NetemParams {
            delay: Some(Duration::from_micros(1500)),
            reorder_percent: Some(10.0),
            ..Default::default()
        };
        assert_eq!(params.to_tc_args(), vec!["delay", "1500us", "reorder", "10%"]);
    }

    #[test]
    fn test_loss_precision() {
        for percent in [0.0, 0.1, 5.0, 33.3, 99.99, 100.0] {
            let params = NetemParams {
                loss_percent: Some(percent),
                ..Default::default()
            };
            let effective = params.effective_loss().unwrap();
            assert!((effective - percent).abs() <= PERCENT_PRECISION);
        }
    }

    #[test]
    fn test_noop() {
        assert!(NetemParams::default().is_noop());
        assert!(NetemParams::default().to_tc_args().is_empty());
    }
}
