//! A SOME/IP runtime for Rust.
//!
//! [SOME/IP](https://some-ip.com/) is the AUTOSAR middleware for in-vehicle
//! service-oriented communication over IP. This crate ties the workspace
//! together: applications attach over a local IPC socket to a per-host
//! routing manager, which owns the wire endpoints, the service registry and
//! the Service Discovery engine, and arbitrates every send between local
//! clients and remote peers.
//!
//! The typical shape of a process:
//!
//! ```no_run
//! # async fn run() -> someip::Result<()> {
//! let runtime = someip::Runtime::from_env()?;
//! let app = runtime.create_application("brake-ctrl").await?;
//! app.offer_service(0x1234, 0x5678, 1, 0).await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

// re-export sub-crates
pub use endpoint;
pub use message;
pub use sd;

pub mod application;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod policy;
pub mod registry;
pub mod routing;
pub mod runtime;

pub use application::Application;
pub use config::Config;
pub use error::{Error, Result};
pub use routing::RoutingState;
pub use runtime::Runtime;

/// Name of the environment variable pointing at the JSON configuration.
pub const CONFIGURATION_ENV: &str = "SOMEIP_CONFIGURATION";
