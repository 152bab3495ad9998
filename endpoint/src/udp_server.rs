use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use message::Message;
use socket2::SockAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::endpoint::{EndpointEvent, EndpointId, EndpointState};
use crate::error::Result;
use crate::queue::{QueueLimits, SendQueue};
use crate::reassembly::ReassemblyMap;
use crate::udp_client::{deliver_datagram, marshal_datagrams, writer_loop};

const INBOUND_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    pub local: SocketAddr,
    /// Multicast group to join on the interface carrying `local`; joining
    /// also enables address/port reuse so several daemons can share the
    /// group (the Service Discovery endpoint relies on this).
    pub multicast: Option<Ipv4Addr>,
    pub max_message_size: usize,
    pub udp_mtu: usize,
    pub tp_enabled: bool,
    pub max_tp_size: usize,
    pub queue_limits: QueueLimits,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        UdpServerConfig {
            local: "0.0.0.0:0".parse().unwrap(),
            multicast: None,
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE_UNRELIABLE,
            udp_mtu: crate::DEFAULT_UDP_MTU,
            tp_enabled: false,
            max_tp_size: crate::DEFAULT_MAX_TP_SIZE,
            queue_limits: QueueLimits::default(),
        }
    }
}

/// Unconnected UDP endpoint: receives from anyone, sends per target.
pub struct UdpServer {
    id: EndpointId,
    config: UdpServerConfig,
    local: SocketAddr,
    queue: Arc<SendQueue>,
    close_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<EndpointState>,
}

impl UdpServer {
    pub async fn start(
        id: EndpointId,
        config: UdpServerConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> Result<Self> {
        let socket = bind_socket(&config)?;
        let local = socket.local_addr()?;

        let queue = Arc::new(SendQueue::new(config.queue_limits.clone()));
        let (close_tx, close_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(EndpointState::Connected);

        let _ = events
            .send(EndpointEvent::Connected {
                endpoint: id,
                peer: None,
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

        log::info!("udp server endpoint bound to {local}");
        Ok(UdpServer {
            id,
            config,
            local,
            queue,
            close_tx,
            state_rx,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> EndpointState {
        *self.state_rx.borrow()
    }

    /// Enqueues `msg` towards `target`, segmenting when necessary.
    pub fn send_to(&self, target: SocketAddr, msg: &Message) -> Result<()> {
        let frames = marshal_datagrams(
            msg,
            Some(target),
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

    pub fn close(&self) {
        self.queue.close();
        let _ = self.close_tx.send(true);
    }
}

/// Multicast membership needs the socket options set before bind, so the
/// socket is built with socket2 and handed to tokio afterwards.
fn bind_socket(config: &UdpServerConfig) -> Result<Arc<UdpSocket>> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if config.multicast.is_some() {
        socket.set_reuse_address(true)?;
        #[cfg(target_family = "unix")]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(config.local))?;

    if let Some(group) = config.multicast {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        log::debug!("joined multicast group {group}");
    }

    Ok(Arc::new(UdpSocket::from_std(socket.into())?))
}

async fn reader_loop(
    id: EndpointId,
    config: UdpServerConfig,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<EndpointEvent>,
    mut close_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<EndpointState>,
) {
    let mut buf = vec![0u8; INBOUND_BUFFER_SIZE];
    let mut reassembly = ReassemblyMap::new(config.max_tp_size);

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }

            res = socket.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(pair) => pair,
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
            peer: None,
        })
        .await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_receive_and_reply() {
        let config = UdpServerConfig {
            local: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let server = UdpServer::start(11, config, events_tx).await.unwrap();

        match events_rx.recv().await.unwrap() {
            EndpointEvent::Connected { peer: None, .. } => {}
            other => panic!("{other:?}"),
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from_static(&[5]));
        client
            .send_to(
                &req.marshal(crate::DEFAULT_UDP_MTU).unwrap(),
                server.local_addr(),
            )
            .await
            .unwrap();

        let (received, peer) = match events_rx.recv().await.unwrap() {
            EndpointEvent::Frame { message, peer, .. } => (message, peer),
            other => panic!("expected Frame, got {other:?}"),
        };
        assert_eq!(received.header.session, 1);
        assert_eq!(peer, client.local_addr().unwrap());

        let resp = Message::response_to(&received, Bytes::from_static(&[6]));
        server.send_to(peer, &resp).unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let parsed = Message::unmarshal(&Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(parsed.header.message_type, message::MessageType::Response);

        server.close();
    }

    #[tokio::test]
    async fn test_multicast_bind() {
        let config = UdpServerConfig {
            local: "0.0.0.0:0".parse().unwrap(),
            multicast: Some(Ipv4Addr::new(224, 0, 0, 0)),
            ..Default::default()
        };
        let (events_tx, _events_rx) = mpsc::channel(16);
        let server = UdpServer::start(12, config, events_tx).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.close();
    }
}
