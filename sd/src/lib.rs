//! SOME/IP Service Discovery engine.
//!
//! The engine is sans-I/O: it owns no sockets and never sleeps. The routing
//! manager drives it with [`engine::SdEngine::handle_message`] for every SD
//! datagram, calls [`engine::SdEngine::handle_timeout`] whenever
//! [`engine::SdEngine::next_timeout`] elapses, and executes the returned
//! [`engine::SdAction`] values (sending datagrams, updating the registry,
//! asking the local provider to accept a subscription). Time is always an
//! explicit [`std::time::Instant`], which keeps the phase machines fully
//! testable without sleeping.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod phase;
pub mod subscriptions;

pub use config::{Reliability, SdConfig};
pub use engine::{RemoteService, SdAction, SdDestination, SdEngine, SubscriptionDecision};
pub use error::{Error, Result};
