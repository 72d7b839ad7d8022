//! Impairment profiles
//!
//! A profile is a named fault description: `{kind, magnitude, variance?,
//! correlation?}`. Profiles are validated when they are constructed (or
//! deserialized), so an unknown kind or an out-of-range magnitude is a
//! configuration error long before any topology exists. Once built a
//! profile is immutable.

use crate::error::ConfigError;
use crate::utils::{check_percent, duration_from_millis_f64, format_duration, parse_duration, parse_percent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fault family of a profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpairmentKind {
    Latency,
    Loss,
    Reorder,
    None,
}

impl ImpairmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpairmentKind::Latency => "latency",
            ImpairmentKind::Loss => "loss",
            ImpairmentKind::Reorder => "reorder",
            ImpairmentKind::None => "none",
        }
    }
}

impl FromStr for ImpairmentKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latency" | "delay" => Ok(ImpairmentKind::Latency),
            "loss" => Ok(ImpairmentKind::Loss),
            "reorder" => Ok(ImpairmentKind::Reorder),
            "none" => Ok(ImpairmentKind::None),
            other => Err(ConfigError::UnsupportedProfile(other.to_string())),
        }
    }
}

impl fmt::Display for ImpairmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A magnitude as written in a profile: a bare number or a unit string
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Magnitude {
    Number(f64),
    Text(String),
}

impl Magnitude {
    fn as_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            Magnitude::Number(ms) => duration_from_millis_f64(*ms),
            Magnitude::Text(text) => parse_duration(text),
        }
    }

    fn as_percent(&self) -> Result<f64, ConfigError> {
        match self {
            Magnitude::Number(value) => check_percent(*value),
            Magnitude::Text(text) => parse_percent(text),
        }
    }
}

impl From<f64> for Magnitude {
    fn from(value: f64) -> Self {
        Magnitude::Number(value)
    }
}

impl From<&str> for Magnitude {
    fn from(value: &str) -> Self {
        Magnitude::Text(value.to_string())
    }
}

impl From<Duration> for Magnitude {
    fn from(value: Duration) -> Self {
        Magnitude::Text(format_duration(value))
    }
}

/// Validated fault parameters
#[derive(Clone, Debug, PartialEq)]
pub enum Impairment {
    /// No impairment; applying it clears the interface
    None,
    /// Fixed delay with optional jitter and jitter correlation (percent)
    Latency {
        delay: Duration,
        jitter: Option<Duration>,
        correlation: Option<f64>,
    },
    /// Random loss probability in percent with optional correlation (percent)
    Loss { percent: f64, correlation: Option<f64> },
    /// Percentage of packets sent out of order; `spread` is the delay applied
    /// to the in-order packets, which is what lets reordered ones overtake
    Reorder {
        percent: f64,
        spread: Option<Duration>,
        correlation: Option<f64>,
    },
}

impl Impairment {
    pub fn kind(&self) -> ImpairmentKind {
        match self {
            Impairment::None => ImpairmentKind::None,
            Impairment::Latency { .. } => ImpairmentKind::Latency,
            Impairment::Loss { .. } => ImpairmentKind::Loss,
            Impairment::Reorder { .. } => ImpairmentKind::Reorder,
        }
    }
}

/// Named, immutable impairment profile
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProfile", into = "RawProfile")]
pub struct ImpairmentProfile {
    name: String,
    impairment: Impairment,
}

impl ImpairmentProfile {
    /// Build a profile from its human-readable description.
    ///
    /// Fails with [`ConfigError::UnsupportedProfile`] for an unknown kind and
    /// with [`ConfigError::InvalidMagnitude`] when a parameter does not fit the
    /// kind (durations for latency, percentages in `[0, 100]` for loss and
    /// reorder).
    pub fn new(
        name: impl Into<String>,
        kind: &str,
        magnitude: Option<Magnitude>,
        variance: Option<Magnitude>,
        correlation: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let kind: ImpairmentKind = kind.parse()?;
        let invalid = |reason: String| ConfigError::InvalidMagnitude {
            kind: kind.to_string(),
            reason,
        };

        let correlation = correlation
            .map(check_percent)
            .transpose()
            .map_err(|e| invalid(format!("correlation: {}", e)))?;

        let impairment = match kind {
            ImpairmentKind::None => Impairment::None,
            ImpairmentKind::Latency => {
                let delay = magnitude
                    .ok_or_else(|| invalid("a delay is required".to_string()))?
                    .as_duration()
                    .map_err(|e| invalid(e.to_string()))?;
                let jitter = variance
                    .map(|v| v.as_duration())
                    .transpose()
                    .map_err(|e| invalid(format!("variance: {}", e)))?;
                // netem correlates the jitter, not the base delay
                if correlation.is_some() && jitter.map_or(true, |j| j.is_zero()) {
                    return Err(invalid("correlation needs a non-zero variance".to_string()));
                }
                Impairment::Latency {
                    delay,
                    jitter,
                    correlation,
                }
            }
            ImpairmentKind::Loss => {
                let percent = magnitude
                    .ok_or_else(|| invalid("a loss percentage is required".to_string()))?
                    .as_percent()
                    .map_err(|e| invalid(e.to_string()))?;
                if variance.is_some() {
                    return Err(invalid("variance is not meaningful for loss".to_string()));
                }
                Impairment::Loss {
                    percent,
                    correlation,
                }
            }
            ImpairmentKind::Reorder => {
                let percent = magnitude
                    .ok_or_else(|| invalid("a reorder percentage is required".to_string()))?
                    .as_percent()
                    .map_err(|e| invalid(e.to_string()))?;
                let spread = variance
                    .map(|v| v.as_duration())
                    .transpose()
                    .map_err(|e| invalid(format!("variance: {}", e)))?;
                Impairment::Reorder {
                    percent,
                    spread,
                    correlation,
                }
            }
        };

        Ok(Self {
            name: name.into(),
            impairment,
        })
    }

    /// Fixed delay with optional jitter
    pub fn latency(name: impl Into<String>, delay: Duration, jitter: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            impairment: Impairment::Latency {
                delay,
                jitter,
                correlation: None,
            },
        }
    }

    /// Random loss, `percent` in `[0, 100]`
    pub fn loss(name: impl Into<String>, percent: f64) -> Result<Self, ConfigError> {
        Self::new(name, "loss", Some(Magnitude::Number(percent)), None, None)
    }

    /// Reordering, `percent` in `[0, 100]`, with an optional delay spread
    pub fn reorder(
        name: impl Into<String>,
        percent: f64,
        spread: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            name,
            "reorder",
            Some(Magnitude::Number(percent)),
            spread.map(Magnitude::from),
            None,
        )
    }

    /// The empty profile
    pub fn none(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            impairment: Impairment::None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ImpairmentKind {
        self.impairment.kind()
    }

    pub fn impairment(&self) -> &Impairment {
        &self.impairment
    }
}

impl fmt::Display for ImpairmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.impairment {
            Impairment::None => write!(f, "{} (none)", self.name),
            Impairment::Latency { delay, jitter, .. } => match jitter {
                Some(j) => write!(
                    f,
                    "{} (latency {} ± {})",
                    self.name,
                    format_duration(*delay),
                    format_duration(*j)
                ),
                None => write!(f, "{} (latency {})", self.name, format_duration(*delay)),
            },
            Impairment::Loss { percent, .. } => write!(f, "{} (loss {}%)", self.name, percent),
            Impairment::Reorder { percent, .. } => {
                write!(f, "{} (reorder {}%)", self.name, percent)
            }
        }
    }
}

/// Wire form of a profile in scenario files
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawProfile {
    name: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    magnitude: Option<Magnitude>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variance: Option<Magnitude>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation: Option<f64>,
}

impl TryFrom<RawProfile> for ImpairmentProfile {
    type Error = ConfigError;

    fn try_from(raw: RawProfile) -> Result<Self, Self::Error> {
        ImpairmentProfile::new(raw.name, &raw.kind, raw.magnitude, raw.variance, raw.correlation)
    }
}

impl From<ImpairmentProfile> for RawProfile {
    fn from(profile: ImpairmentProfile) -> Self {
        let kind = profile.kind().to_string();
        let (magnitude, variance, correlation) = match profile.impairment {
            Impairment::None => (None, None, None),
            Impairment::Latency {
                delay,
                jitter,
                correlation,
            } => (Some(delay.into()), jitter.map(Magnitude::from), correlation),
            Impairment::Loss {
                percent,
                correlation,
            } => (Some(Magnitude::Number(percent)), None, correlation),
            Impairment::Reorder {
                percent,
                spread,
                correlation,
            } => (
                Some(Magnitude::Number(percent)),
                spread.map(Magnitude::from),
                correlation,
            ),
        };
        RawProfile {
            name: profile.name,
            kind,
            magnitude,
            variance,
            correlation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_fails_at_construction() {
        let err = ImpairmentProfile::new("weird", "corrupt", Some(1.0.into()), None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedProfile(ref k) if k == "corrupt"));
    }

    #[test]
    fn test_latency_from_strings() {
        let profile =
            ImpairmentProfile::new("wan", "latency", Some("100ms".into()), Some("20ms".into()), Some(25.0))
                .unwrap();
        assert_eq!(profile.kind(), ImpairmentKind::Latency);
        assert_eq!(
            profile.impairment(),
            &Impairment::Latency {
                delay: Duration::from_millis(100),
                jitter: Some(Duration::from_millis(20)),
                correlation: Some(25.0),
            }
        );
    }

    #[test]
    fn test_latency_correlation_requires_variance() {
        for variance in [None, Some(Magnitude::from("0ms"))] {
            let err = ImpairmentProfile::new("wan", "latency", Some("100ms".into()), variance, Some(25.0))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidMagnitude { .. }), "{:?}", err);
        }

        let json = r#"{"name":"wan","kind":"latency","magnitude":"100ms","correlation":25}"#;
        assert!(serde_json::from_str::<ImpairmentProfile>(json).is_err());
    }

    #[test]
    fn test_loss_range_is_enforced() {
        assert!(ImpairmentProfile::loss("ok", 0.0).is_ok());
        assert!(ImpairmentProfile::loss("ok", 100.0).is_ok());
        assert!(matches!(
            ImpairmentProfile::loss("bad", 120.0),
            Err(ConfigError::InvalidMagnitude { .. })
        ));
        assert!(ImpairmentProfile::new("bad", "loss", Some("5%".into()), Some("1ms".into()), None).is_err());
    }

    #[test]
    fn test_missing_magnitude() {
        assert!(ImpairmentProfile::new("x", "latency", None, None, None).is_err());
        assert!(ImpairmentProfile::new("x", "none", None, None, None).is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_validation() {
        let json = r#"{"name":"lossy","kind":"loss","magnitude":"5%","correlation":10}"#;
        let profile: ImpairmentProfile = serde_json::from_str(json).unwrap();
        assert_eq!(
            profile.impairment(),
            &Impairment::Loss {
                percent: 5.0,
                correlation: Some(10.0)
            }
        );

        let text = serde_json::to_string(&profile).unwrap();
        let again: ImpairmentProfile = serde_json::from_str(&text).unwrap();
        assert_eq!(again, profile);

        let bad = r#"{"name":"x","kind":"blackhole","magnitude":1}"#;
        assert!(serde_json::from_str::<ImpairmentProfile>(bad).is_err());
    }
}
