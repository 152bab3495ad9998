#[cfg(test)]
mod udp_client_test;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use message::{tp, Message};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::endpoint::{EndpointEvent, EndpointId, EndpointState, Transport};
use crate::error::{Error, Result};
use crate::queue::{OutboundFrame, QueueLimits, SendQueue};
use crate::reassembly::ReassemblyMap;

const INBOUND_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct UdpClientConfig {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Cap for a single (possibly reassembled) message.
    pub max_message_size: usize,
    /// Datagram budget; larger messages are TP segmented when enabled.
    pub udp_mtu: usize,
    pub tp_enabled: bool,
    pub max_tp_size: usize,
    pub queue_limits: QueueLimits,
}

impl Default for UdpClientConfig {
    fn default() -> Self {
        UdpClientConfig {
            local: "0.0.0.0:0".parse().unwrap(),
            remote: "0.0.0.0:0".parse().unwrap(),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE_UNRELIABLE,
            udp_mtu: crate::DEFAULT_UDP_MTU,
            tp_enabled: false,
            max_tp_size: crate::DEFAULT_MAX_TP_SIZE,
            queue_limits: QueueLimits::default(),
        }
    }
}

/// Unreliable endpoint talking to one fixed remote.
pub struct UdpClient {
    id: EndpointId,
    config: UdpClientConfig,
    queue: Arc<SendQueue>,
    close_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<EndpointState>,
}

impl UdpClient {
    pub async fn start(
        id: EndpointId,
        config: UdpClientConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.local).await?;
        socket.connect(config.remote).await?;
        let socket = Arc::new(socket);

        let queue = Arc::new(SendQueue::new(config.queue_limits.clone()));
        let (close_tx, close_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(EndpointState::Connected);

        let _ = events
            .send(EndpointEvent::Connected {
                endpoint: id,
                peer: Some(config.remote),
            })
            .await;

        tokio::spawn(writer_loop(socket.clone(), queue.clone()));
        tokio::spawn(reader_loop(
            id,
            config.clone(),
            socket,
            events,
            close_rx,
            state_tx,
        ));

        Ok(UdpClient {
            id,
            config,
            queue,
            close_tx,
            state_rx,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.config.remote
    }

    pub fn state(&self) -> EndpointState {
        *self.state_rx.borrow()
    }

    /// Enqueues `msg`, segmenting it when it exceeds the datagram budget.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let frames = marshal_datagrams(
            msg,
            None,
            self.config.udp_mtu,
            self.config.tp_enabled,
            self.config.max_tp_size,
        )?;
        for frame in frames {
            self.queue.enqueue(frame)?;
        }
        Ok(())
    }

    pub fn flush(&self) {
        self.queue.flush();
    }

    pub async fn close(&self) {
        self.queue.close();
        let _ = self.close_tx.send(()).await;
    }
}

/// Marshals `msg` into one datagram, or a TP segment train when it exceeds
/// the MTU budget and TP is enabled.
pub(crate) fn marshal_datagrams(
    msg: &Message,
    target: Option<SocketAddr>,
    udp_mtu: usize,
    tp_enabled: bool,
    max_tp_size: usize,
) -> Result<Vec<OutboundFrame>> {
    let is_response = msg.header.message_type.is_response();
    let service = msg.header.service;
    let method = msg.header.method;

    let frame = |data: Bytes| OutboundFrame {
        data,
        service,
        method,
        is_response,
        target,
    };

    if msg.wire_size() <= udp_mtu {
        return Ok(vec![frame(msg.marshal(udp_mtu)?)]);
    }

    if !tp_enabled || msg.wire_size() > max_tp_size {
        return Err(Error::ErrMessageTooLarge);
    }

    tp::segment(msg, udp_mtu)?
        .iter()
        .map(|s| Ok(frame(s.marshal(udp_mtu)?)))
        .collect()
}

pub(crate) async fn writer_loop(socket: Arc<UdpSocket>, queue: Arc<SendQueue>) {
    while let Some(frame) = queue.dequeue().await {
        let res = match frame.target {
            Some(target) => socket.send_to(&frame.data, target).await,
            None => socket.send(&frame.data).await,
        };
        if let Err(e) = res {
            log::warn!("udp write failed: {e}");
        }
    }
}

async fn reader_loop(
    id: EndpointId,
    config: UdpClientConfig,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<EndpointEvent>,
    mut close_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<EndpointState>,
) {
    let mut buf = vec![0u8; INBOUND_BUFFER_SIZE];
    let mut reassembly = ReassemblyMap::new(config.max_tp_size);
    let peer = config.remote;

    loop {
        tokio::select! {
            _ = close_rx.recv() => break,

            res = socket.recv(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("udp read failed: {e}");
                        continue;
                    }
                };

                deliver_datagram(
                    id,
                    peer,
                    Bytes::copy_from_slice(&buf[..n]),
                    &mut reassembly,
                    &events,
                )
                .await;
            }
        }
    }

    let _ = state_tx.send(EndpointState::Closed);
    let _ = events
        .send(EndpointEvent::Disconnected {
            endpoint: id,
            peer: Some(peer),
        })
        .await;
}

/// Parses one datagram and forwards the resulting frame upward. Shared with
/// the server endpoint.
pub(crate) async fn deliver_datagram(
    id: EndpointId,
    peer: SocketAddr,
    datagram: Bytes,
    reassembly: &mut ReassemblyMap,
    events: &mpsc::Sender<EndpointEvent>,
) {
    let msg = match Message::unmarshal(&datagram) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("dropping malformed datagram from {peer}: {e}");
            let _ = events
                .send(EndpointEvent::CodecError {
                    endpoint: id,
                    peer: Some(peer),
                    error: e,
                })
                .await;
            return;
        }
    };

    match reassembly.process(peer, msg) {
        Ok(Some(complete)) => {
            let _ = events
                .send(EndpointEvent::Frame {
                    endpoint: id,
                    transport: Transport::Udp,
                    peer,
                    message: complete,
                })
                .await;
        }
        Ok(None) => {}
        Err(Error::Codec(e)) => {
            log::debug!("tp reassembly from {peer} aborted: {e}");
            let _ = events
                .send(EndpointEvent::CodecError {
                    endpoint: id,
                    peer: Some(peer),
                    error: e,
                })
                .await;
        }
        Err(e) => {
            log::debug!("tp reassembly from {peer} aborted: {e}");
        }
    }
}
