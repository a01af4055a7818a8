//! Step providers that reach outside the engine process.

pub mod shell;

pub use shell::ShellProvider;
