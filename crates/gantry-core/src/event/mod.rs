//! Engine event distribution.
//!
//! Provides an `EventBus` that fans `EngineEvent`s out to every subscriber
//! via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
