//! Concord Flow
//!
//! This crate provides the validated flow representation for Concord.
//! A flow is the checked form of a [`concord_config::FlowDef`] that sessions
//! are created from.
//!
//! Key differences from `concord-config`:
//! - Steps have ids, names and 1-based numbers
//! - Dependencies, barrier gates and share sources refer to real steps
//! - The dependency relation is acyclic (cycles are reported in order)
//! - Targets refer to declared groups, roles or identities
//!
//! The [`Roster`] turns group names into concrete participant identities
//! once per session.

mod error;
mod flow;
mod graph;
mod roster;
mod validate;

pub use concord_config::{AccessKind, Strategy};
pub use error::FlowError;
pub use flow::{
  ALL_TARGET, Barrier, Coordination, DEFAULT_COORDINATION_URL, Datasites, Flow, OutputRef, Role,
  Run, Share, Step,
};
pub use graph::Graph;
pub use roster::{DatasiteToken, Participant, Roster};
