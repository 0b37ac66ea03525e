//! Concord Config
//!
//! This crate contains the serializable flow document types for Concord.
//! These types mirror a flow definition exactly as it travels inside an
//! invitation message, before it is validated and turned into a DAG by
//! `concord-flow`.
//!
//! Documents can be loaded from:
//! - YAML files (via CLI with `concord validate flow.yaml`)
//! - JSON values embedded in `flow_invitation` message metadata
//!
//! Nothing here is validated beyond its shape. Required fields that the
//! validator wants to report precisely (step `id`, step `name`,
//! `datasites.all`) are therefore optional at this layer.

mod datasites;
mod error;
mod flow;
mod step;
mod targets;

pub use datasites::{CoordinationDef, DatasitesDef, GroupDef, RoleDef};
pub use error::ConfigError;
pub use flow::{FLOW_KIND, FlowDef, FlowSpecDef, MetadataDef};
pub use step::{AccessKind, BarrierDef, RunDef, ShareDef, StepDef, Strategy, TimeoutDef};
pub use targets::Targets;
