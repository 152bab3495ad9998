use std::fmt;
use std::net::SocketAddr;

use message::Message;

/// Opaque endpoint identity, assigned by the owner at construction time and
/// echoed in every [`EndpointEvent`] so events can be demultiplexed.
pub type EndpointId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Connection lifecycle of an endpoint.
///
/// UDP endpoints jump straight to `Connected` once bound; TCP endpoints walk
/// the whole machine and re-enter `Connecting` on reconnect.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Upcalls from an endpoint to its owner.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A complete SOME/IP message arrived (TP segments already reassembled).
    Frame {
        endpoint: EndpointId,
        transport: Transport,
        peer: SocketAddr,
        message: Message,
    },
    /// The transport became usable (TCP connect / accept, UDP bind).
    Connected {
        endpoint: EndpointId,
        peer: Option<SocketAddr>,
    },
    /// A peer connection ended; for clients a reconnect may follow.
    Disconnected {
        endpoint: EndpointId,
        peer: Option<SocketAddr>,
    },
    /// A frame failed to decode. The owner counts these per endpoint and
    /// resets the endpoint when the counter crosses its threshold.
    CodecError {
        endpoint: EndpointId,
        peer: Option<SocketAddr>,
        error: message::Error,
    },
}

impl EndpointEvent {
    pub fn endpoint(&self) -> EndpointId {
        match self {
            EndpointEvent::Frame { endpoint, .. }
            | EndpointEvent::Connected { endpoint, .. }
            | EndpointEvent::Disconnected { endpoint, .. }
            | EndpointEvent::CodecError { endpoint, .. } => *endpoint,
        }
    }
}
