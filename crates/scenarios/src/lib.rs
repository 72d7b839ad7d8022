//! Scenario definitions and presets for the resilinet testbench
//!
//! This crate provides the declarative side of a conformance run: the
//! endpoints and links to build, the impairment profiles to apply to link
//! sides, and the protocol test (with its assertion parameters) to execute.
//! Everything here is plain data that can be loaded from JSON and is
//! validated eagerly, before any network resource is touched.

pub mod builder;
pub mod error;
pub mod link;
pub mod presets;
pub mod profile;
pub mod scenario;
pub mod utils;

pub use builder::ScenarioBuilder;
pub use error::ConfigError;
pub use link::{LinkSpec, NodeSpec};
pub use presets::Presets;
pub use profile::{Impairment, ImpairmentKind, ImpairmentProfile};
pub use scenario::{ImpairmentTarget, ProtocolTest, ScenarioSpec, SequencePolicy};
