use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use message::framing::StreamDecoder;
use message::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::endpoint::{EndpointEvent, EndpointId, Transport};
use crate::error::{Error, Result};
use crate::queue::{OutboundFrame, QueueLimits, SendQueue};
use crate::reassembly::ReassemblyMap;

const INITIAL_RX_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub local: SocketAddr,
    pub max_message_size: usize,
    pub cookies_enabled: bool,
    pub tp_enabled: bool,
    pub max_tp_size: usize,
    /// Applied per accepted connection.
    pub queue_limits: QueueLimits,
    pub write_timeout: Duration,
    pub buffer_shrink_threshold: u32,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            local: "0.0.0.0:0".parse().unwrap(),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE_RELIABLE,
            cookies_enabled: false,
            tp_enabled: false,
            max_tp_size: crate::DEFAULT_MAX_TP_SIZE,
            queue_limits: QueueLimits::default(),
            write_timeout: Duration::from_secs(10),
            buffer_shrink_threshold: 5,
        }
    }
}

/// Reliable server endpoint: accepts peers and keeps one ordered send queue
/// per accepted connection.
pub struct TcpServer {
    id: EndpointId,
    local: SocketAddr,
    config: TcpServerConfig,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<SendQueue>>>>,
    close_tx: watch::Sender<bool>,
}

impl TcpServer {
    pub async fn start(
        id: EndpointId,
        config: TcpServerConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.local).await?;
        let local = listener.local_addr()?;

        let peers: Arc<Mutex<HashMap<SocketAddr, Arc<SendQueue>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (close_tx, close_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            id,
            config.clone(),
            listener,
            peers.clone(),
            events,
            close_rx,
        ));

        log::info!("tcp server endpoint listening on {local}");
        Ok(TcpServer {
            id,
            local,
            config,
            peers,
            close_tx,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Sends `msg` to a connected peer.
    pub fn send_to(&self, peer: SocketAddr, msg: &Message) -> Result<()> {
        let queue = {
            let peers = self.peers.lock().unwrap();
            peers.get(&peer).cloned().ok_or(Error::ErrUnknownPeer)?
        };

        for frame in marshal_frames(msg, &self.config)? {
            queue.enqueue(frame)?;
        }
        Ok(())
    }

    pub fn has_peer(&self, peer: SocketAddr) -> bool {
        self.peers.lock().unwrap().contains_key(&peer)
    }

    /// Stops accepting and lets every connection drain its queued responses.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
        let peers = self.peers.lock().unwrap();
        for queue in peers.values() {
            queue.close_graceful();
        }
    }
}

fn marshal_frames(msg: &Message, config: &TcpServerConfig) -> Result<Vec<OutboundFrame>> {
    let is_response = msg.header.message_type.is_response();
    let frame = |data| OutboundFrame {
        data,
        service: msg.header.service,
        method: msg.header.method,
        is_response,
        target: None,
    };

    if msg.wire_size() <= config.max_message_size {
        return Ok(vec![frame(msg.marshal(config.max_message_size)?)]);
    }
    if !config.tp_enabled || msg.wire_size() > config.max_tp_size {
        return Err(Error::ErrMessageTooLarge);
    }
    message::tp::segment(msg, config.max_message_size)?
        .iter()
        .map(|s| Ok(frame(s.marshal(config.max_message_size)?)))
        .collect()
}

async fn accept_loop(
    id: EndpointId,
    config: TcpServerConfig,
    listener: TcpListener,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<SendQueue>>>>,
    events: mpsc::Sender<EndpointEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);

                let queue = Arc::new(SendQueue::new(config.queue_limits.clone()));
                peers.lock().unwrap().insert(peer, queue.clone());

                let _ = events.send(EndpointEvent::Connected {
                    endpoint: id,
                    peer: Some(peer),
                }).await;

                tokio::spawn(connection_loop(
                    id,
                    config.clone(),
                    stream,
                    peer,
                    queue,
                    peers.clone(),
                    events.clone(),
                    close_rx.clone(),
                ));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    id: EndpointId,
    config: TcpServerConfig,
    mut stream: TcpStream,
    peer: SocketAddr,
    queue: Arc<SendQueue>,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<SendQueue>>>>,
    events: mpsc::Sender<EndpointEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (mut rd, mut wr) = stream.split();
    let mut rx_buf = BytesMut::with_capacity(INITIAL_RX_CAPACITY);
    let mut decoder = StreamDecoder::new(config.cookies_enabled, config.max_message_size);
    let mut reassembly = ReassemblyMap::new(config.max_tp_size);
    let mut idle_reads: u32 = 0;

    'session: loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    queue.close_graceful();
                }
            }

            res = rd.read_buf(&mut rx_buf) => {
                let n = match res {
                    Ok(0) | Err(_) => break 'session,
                    Ok(n) => n,
                };
                log::trace!("read {n} bytes from {peer}");

                loop {
                    match decoder.next_frame(&mut rx_buf) {
                        Ok(Some(frame)) => match reassembly.process(peer, frame) {
                            Ok(Some(complete)) => {
                                let _ = events.send(EndpointEvent::Frame {
                                    endpoint: id,
                                    transport: Transport::Tcp,
                                    peer,
                                    message: complete,
                                }).await;
                            }
                            Ok(None) => {}
                            Err(Error::Codec(codec)) => {
                                let _ = events.send(EndpointEvent::CodecError {
                                    endpoint: id,
                                    peer: Some(peer),
                                    error: codec,
                                }).await;
                            }
                            Err(_) => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            let _ = events.send(EndpointEvent::CodecError {
                                endpoint: id,
                                peer: Some(peer),
                                error: e,
                            }).await;
                            break 'session;
                        }
                    }
                }

                if !config.cookies_enabled && rx_buf.len() > config.max_message_size {
                    log::warn!("receive buffer for {peer} exceeded message cap, resetting");
                    break 'session;
                }

                if rx_buf.is_empty() {
                    idle_reads += 1;
                    if idle_reads >= config.buffer_shrink_threshold
                        && rx_buf.capacity() > INITIAL_RX_CAPACITY
                    {
                        rx_buf = BytesMut::with_capacity(INITIAL_RX_CAPACITY);
                        idle_reads = 0;
                    }
                } else {
                    idle_reads = 0;
                }
            }

            frame = queue.dequeue() => {
                let frame = match frame {
                    Some(f) => f,
                    None => break 'session,
                };
                match timeout(config.write_timeout, wr.write_all(&frame.data)).await {
                    Ok(Ok(())) => {}
                    _ => break 'session,
                }
            }
        }
    }

    queue.close();
    peers.lock().unwrap().remove(&peer);
    let _ = events
        .send(EndpointEvent::Disconnected {
            endpoint: id,
            peer: Some(peer),
        })
        .await;
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_accept_receive_respond() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let server = TcpServer::start(7, TcpServerConfig::default(), events_tx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let peer = match events_rx.recv().await.unwrap() {
            EndpointEvent::Connected { peer: Some(p), .. } => p,
            other => panic!("expected Connected, got {other:?}"),
        };

        let max = crate::DEFAULT_MAX_MESSAGE_SIZE_RELIABLE;
        let req = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from_static(&[1, 2]));
        client.write_all(&req.marshal(max).unwrap()).await.unwrap();

        let received = match events_rx.recv().await.unwrap() {
            EndpointEvent::Frame { message, .. } => message,
            other => panic!("expected Frame, got {other:?}"),
        };
        assert_eq!(received.header.session, 1);

        let resp = Message::response_to(&received, Bytes::from_static(&[9]));
        server.send_to(peer, &resp).unwrap();

        let mut buf = BytesMut::new();
        let mut decoder = StreamDecoder::new(false, max);
        let parsed = loop {
            if let Some(m) = decoder.next_frame(&mut buf).unwrap() {
                break m;
            }
            client.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(parsed.header.message_type, message::MessageType::Response);
        assert_eq!(parsed.payload, Bytes::from_static(&[9]));

        server.close();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let server = TcpServer::start(8, TcpServerConfig::default(), events_tx)
            .await
            .unwrap();

        let msg = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::new());
        assert_eq!(
            server.send_to("127.0.0.1:1".parse().unwrap(), &msg),
            Err(Error::ErrUnknownPeer)
        );
        server.close();
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_reported() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let server = TcpServer::start(9, TcpServerConfig::default(), events_tx)
            .await
            .unwrap();

        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        match events_rx.recv().await.unwrap() {
            EndpointEvent::Connected { .. } => {}
            other => panic!("{other:?}"),
        }

        drop(client);
        match events_rx.recv().await.unwrap() {
            EndpointEvent::Disconnected { peer: Some(_), .. } => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert!(!server.has_peer("127.0.0.1:1".parse().unwrap()));

        server.close();
    }
}
