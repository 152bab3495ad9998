//! Transport endpoints for the SOME/IP runtime.
//!
//! The routing manager owns one endpoint object per transport surface: TCP
//! client/server, UDP client/server. Every endpoint runs its own reader and
//! writer tasks; inbound frames and lifecycle transitions are delivered to
//! the owner through a single mpsc event channel, outbound frames go through
//! a bounded, byte-accounted [`queue::SendQueue`].
//!
//! Endpoints never interpret message semantics. They frame, segment and
//! reassemble; routing decisions stay with the owner.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod endpoint;
pub mod error;
pub mod queue;
pub mod reassembly;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;

pub use endpoint::{EndpointEvent, EndpointId, EndpointState, Transport};
pub use error::{Error, Result};
pub use queue::{OutboundFrame, QueueLimits, SendQueue};
pub use tcp_client::{TcpClient, TcpClientConfig};
pub use tcp_server::{TcpServer, TcpServerConfig};
pub use udp_client::{UdpClient, UdpClientConfig};
pub use udp_server::{UdpServer, UdpServerConfig};

/// Default UDP payload budget before SOME/IP-TP segmentation kicks in.
pub const DEFAULT_UDP_MTU: usize = 1400;

/// Default cap for a single reliable (TCP) message.
pub const DEFAULT_MAX_MESSAGE_SIZE_RELIABLE: usize = 4095 + message::HEADER_SIZE;

/// Default cap for a single unreliable (UDP) message.
pub const DEFAULT_MAX_MESSAGE_SIZE_UNRELIABLE: usize = DEFAULT_UDP_MTU;

/// Default cap for a reassembled SOME/IP-TP message.
pub const DEFAULT_MAX_TP_SIZE: usize = 1 << 20;
