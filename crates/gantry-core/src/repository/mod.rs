//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (gantry-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` provides process-local implementations for
//! embedding and tests.

pub mod checkpoint;
pub mod memory;
pub mod rate_limit;
