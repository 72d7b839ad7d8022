//! Builder pattern for creating custom scenarios
//!
//! This module provides ScenarioBuilder for constructing ScenarioSpec
//! instances with a fluent API. `build()` validates the result.

use crate::error::ConfigError;
use crate::link::{LinkSpec, NodeSpec};
use crate::profile::ImpairmentProfile;
use crate::scenario::{ImpairmentTarget, ProtocolTest, ScenarioSpec};

/// Scenario builder for creating custom scenarios
pub struct ScenarioBuilder {
    name: String,
    description: String,
    nodes: Vec<NodeSpec>,
    links: Vec<LinkSpec>,
    impairments: Vec<ImpairmentTarget>,
    protocol_test: Option<ProtocolTest>,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            links: Vec::new(),
            impairments: Vec::new(),
            protocol_test: None,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(NodeSpec::new(name));
        self
    }

    pub fn add_link(mut self, link: LinkSpec) -> Self {
        self.links.push(link);
        self
    }

    /// Shape `node`'s side of link `link` with `profile`
    pub fn impair(mut self, node: impl Into<String>, link: usize, profile: ImpairmentProfile) -> Self {
        self.impairments.push(ImpairmentTarget {
            node: node.into(),
            link,
            profile,
        });
        self
    }

    pub fn protocol_test(mut self, test: ProtocolTest) -> Self {
        self.protocol_test = Some(test);
        self
    }

    pub fn build(self) -> Result<ScenarioSpec, ConfigError> {
        let protocol_test = self
            .protocol_test
            .ok_or_else(|| ConfigError::InvalidTest("no protocol test configured".to_string()))?;
        let spec = ScenarioSpec {
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            links: self.links,
            impairments: self.impairments,
            protocol_test,
        };
        spec.validate()?;
        Ok(spec)
    }
}
