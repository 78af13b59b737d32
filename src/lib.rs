//! Scriptgate - runs a scripting-language web app behind single-use backends
//!
//! This library provides a gateway that:
//! - Starts the interpreter's built-in web server on a free loopback port
//! - Proxies each inbound request to a backend that has never served before
//! - Watches the interpreter's diagnostic stream and replaces the response
//!   with an error page when a notice, warning or fatal error is logged
//! - Races every request against a timeout
//! - Keeps a pool of pre-started backends so requests rarely wait for startup

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod pool;
pub mod process;
pub mod proxy;

/// Package name, for logs
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version, for logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
