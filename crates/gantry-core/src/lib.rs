//! Business logic and repository trait definitions for Gantry.
//!
//! This crate defines the "ports" (repository and provider traits) that the
//! infrastructure layer implements. It depends only on `gantry-types` -- never
//! on `gantry-infra` or any database/IO crate.

pub mod contract;
pub mod event;
pub mod provider;
pub mod repository;
pub mod resilience;
pub mod workflow;

#[cfg(test)]
mod test_support;
