//! Devstack bootstraps a local web development environment (MySQL, PHP
//! FastCGI, Nginx, a trusted development certificate and Mailpit) from a
//! single root directory, and starts, stops, restarts or reports on all of
//! those services as a unit.

/// Self-signed certificate lifecycle.
pub mod certs;

/// CLI interface.
pub mod cli;

/// Foreground command execution.
pub mod command;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Hosts file synchronization.
pub mod hosts;

/// Template rendering.
pub mod materialize;

/// Concurrent fan-out of lifecycle actions.
pub mod orchestrator;

/// Host OS adapters.
pub mod platform;

/// Process supervision.
pub mod process;

/// Per-service controllers.
pub mod services;

#[doc(hidden)]
pub mod test_utils;
