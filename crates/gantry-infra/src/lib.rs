//! Infrastructure layer for Gantry.
//!
//! Contains implementations of the ports defined in `gantry-core`: SQLite
//! checkpoint and rate-limit storage, the TOML engine-config loader, and the
//! `shell` step provider.

pub mod config;
pub mod provider;
pub mod sqlite;
