//! Shared domain types for Gantry.
//!
//! This crate contains the domain types used across the workflow engine:
//! workflow and step definitions, runs, checkpoints, role contracts, engine
//! configuration, engine events, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod contract;
pub mod error;
pub mod event;
pub mod workflow;
