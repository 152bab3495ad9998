//! SOME/IP wire format support
//!
//! [SOME/IP](https://some-ip.com/) is the AUTOSAR service-oriented middleware
//! protocol used for in-vehicle IP communication. This crate implements the
//! on-wire message format: the 16 byte header, Magic Cookie frames, the TCP
//! stream framing with cookie resynchronization, the SOME/IP-TP segmentation
//! layer for payloads that exceed a datagram budget, and the Service
//! Discovery payload format (entries and options).
//!
//! The crate is transport agnostic. Sockets, queues and routing live in the
//! `someip-endpoint` and `someip` crates; everything here operates on
//! [`bytes::Bytes`] values and is directly testable against byte fixtures.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod cookie;
pub mod error;
pub mod framing;
pub mod header;
pub mod message;
pub mod sd;
pub mod tp;
pub mod types;

pub use error::{Error, Result};
pub use header::{Header, MessageType, ReturnCode, HEADER_SIZE, PROTOCOL_VERSION};
pub use message::Message;
pub use types::*;
