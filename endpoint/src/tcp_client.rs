#[cfg(test)]
mod tcp_client_test;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use message::framing::StreamDecoder;
use message::{tp, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::endpoint::{EndpointEvent, EndpointId, EndpointState, Transport};
use crate::error::{Error, Result};
use crate::queue::{OutboundFrame, QueueLimits, SendQueue};
use crate::reassembly::ReassemblyMap;

const INITIAL_RX_CAPACITY: usize = 16 * 1024;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub remote: SocketAddr,
    pub max_message_size: usize,
    pub cookies_enabled: bool,
    pub tp_enabled: bool,
    pub max_tp_size: usize,
    pub queue_limits: QueueLimits,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub max_reconnect_backoff: Duration,
    /// Keep queued frames across a reconnect.
    pub queue_on_reconnect: bool,
    /// Shrink the receive buffer after this many reads that drained it.
    pub buffer_shrink_threshold: u32,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        TcpClientConfig {
            remote: "0.0.0.0:0".parse().unwrap(),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE_RELIABLE,
            cookies_enabled: false,
            tp_enabled: false,
            max_tp_size: crate::DEFAULT_MAX_TP_SIZE,
            queue_limits: QueueLimits::default(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            max_reconnect_backoff: Duration::from_secs(30),
            queue_on_reconnect: true,
            buffer_shrink_threshold: 5,
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// close() was called; do not reconnect.
    Shutdown,
    /// Read/write error, EOF or codec failure; reconnect with backoff.
    Lost,
}

/// Reliable endpoint that dials one remote and keeps dialing it.
///
/// The driver walks `Disconnected → Connecting → Connected` and falls back
/// to `Connecting` after an exponential backoff whenever the session is
/// lost. `close()` enters `Closing`, lets queued responses drain and ends in
/// `Closed`.
pub struct TcpClient {
    id: EndpointId,
    config: TcpClientConfig,
    queue: Arc<SendQueue>,
    close_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<EndpointState>,
}

impl TcpClient {
    /// Spawns the driver. Connection establishment happens asynchronously;
    /// frames may be enqueued right away and go out once connected.
    pub fn start(
        id: EndpointId,
        config: TcpClientConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> Self {
        let queue = Arc::new(SendQueue::new(config.queue_limits.clone()));
        let (close_tx, close_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(EndpointState::Disconnected);

        tokio::spawn(driver(
            id,
            config.clone(),
            queue.clone(),
            events,
            close_rx,
            state_tx,
        ));

        TcpClient {
            id,
            config,
            queue,
            close_tx,
            state_rx,
        }
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

    /// Waits until the endpoint leaves the given state.
    pub async fn state_changed(&self, from: EndpointState) -> EndpointState {
        let mut rx = self.state_rx.clone();
        loop {
            let current = *rx.borrow();
            if current != from {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn send(&self, msg: &Message) -> Result<()> {
        for frame in marshal_stream_frames(msg, &self.config)? {
            self.queue.enqueue(frame)?;
        }
        Ok(())
    }

    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Graceful shutdown: queued responses drain, then the connection and
    /// the driver end.
    pub async fn close(&self) {
        self.queue.close_graceful();
        let _ = self.close_tx.send(()).await;
    }
}

fn marshal_stream_frames(msg: &Message, config: &TcpClientConfig) -> Result<Vec<OutboundFrame>> {
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
    tp::segment(msg, config.max_message_size)?
        .iter()
        .map(|s| Ok(frame(s.marshal(config.max_message_size)?)))
        .collect()
}

async fn driver(
    id: EndpointId,
    config: TcpClientConfig,
    queue: Arc<SendQueue>,
    events: mpsc::Sender<EndpointEvent>,
    mut close_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<EndpointState>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let _ = state_tx.send(EndpointState::Connecting);

        let stream = tokio::select! {
            _ = close_rx.recv() => break,
            res = timeout(config.connect_timeout, TcpStream::connect(config.remote)) => {
                match res {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        log::debug!("connect to {} failed: {e}", config.remote);
                        None
                    }
                    Err(_) => {
                        log::debug!("connect to {} timed out", config.remote);
                        None
                    }
                }
            }
        };

        if let Some(stream) = stream {
            backoff = INITIAL_BACKOFF;
            let _ = stream.set_nodelay(true);
            let _ = state_tx.send(EndpointState::Connected);
            let _ = events
                .send(EndpointEvent::Connected {
                    endpoint: id,
                    peer: Some(config.remote),
                })
                .await;

            let end = run_session(id, &config, stream, &queue, &events, &mut close_rx).await;

            let _ = state_tx.send(EndpointState::Closing);
            let _ = events
                .send(EndpointEvent::Disconnected {
                    endpoint: id,
                    peer: Some(config.remote),
                })
                .await;

            if matches!(end, SessionEnd::Shutdown) {
                break;
            }
            if !config.queue_on_reconnect {
                queue.clear();
            }
        }

        // exponential backoff, abortable by close()
        tokio::select! {
            _ = close_rx.recv() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = Duration::min(backoff * 2, config.max_reconnect_backoff);
    }

    queue.close();
    let _ = state_tx.send(EndpointState::Closed);
}

async fn run_session(
    id: EndpointId,
    config: &TcpClientConfig,
    mut stream: TcpStream,
    queue: &Arc<SendQueue>,
    events: &mpsc::Sender<EndpointEvent>,
    close_rx: &mut mpsc::Receiver<()>,
) -> SessionEnd {
    let peer = config.remote;
    let (mut rd, mut wr) = stream.split();

    let mut rx_buf = BytesMut::with_capacity(INITIAL_RX_CAPACITY);
    let mut decoder = StreamDecoder::new(config.cookies_enabled, config.max_message_size);
    let mut reassembly = ReassemblyMap::new(config.max_tp_size);
    let mut idle_reads: u32 = 0;
    let mut draining = false;

    loop {
        tokio::select! {
            _ = close_rx.recv(), if !draining => {
                // let queued responses go out before tearing down
                draining = true;
                queue.close_graceful();
            }

            res = rd.read_buf(&mut rx_buf) => {
                let n = match res {
                    Ok(0) => {
                        log::debug!("peer {peer} closed the connection");
                        return SessionEnd::Lost;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!("read from {peer} failed: {e}");
                        return SessionEnd::Lost;
                    }
                };
                log::trace!("read {n} bytes from {peer}");

                loop {
                    match decoder.next_frame(&mut rx_buf) {
                        Ok(Some(frame)) => {
                            match reassembly.process(peer, frame) {
                                Ok(Some(complete)) => {
                                    let _ = events.send(EndpointEvent::Frame {
                                        endpoint: id,
                                        transport: Transport::Tcp,
                                        peer,
                                        message: complete,
                                    }).await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    if let Error::Codec(codec) = e {
                                        let _ = events.send(EndpointEvent::CodecError {
                                            endpoint: id,
                                            peer: Some(peer),
                                            error: codec,
                                        }).await;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // unrecoverable without cookies: reset the
                            // connection to resynchronize
                            let _ = events.send(EndpointEvent::CodecError {
                                endpoint: id,
                                peer: Some(peer),
                                error: e,
                            }).await;
                            return SessionEnd::Lost;
                        }
                    }
                }

                // runaway peer protection
                if !config.cookies_enabled && rx_buf.len() > config.max_message_size {
                    log::warn!("receive buffer for {peer} exceeded message cap, resetting");
                    return SessionEnd::Lost;
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
                    // queue drained after close(): session is done
                    None => return SessionEnd::Shutdown,
                };
                match timeout(config.write_timeout, wr.write_all(&frame.data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!("write to {peer} failed: {e}");
                        return SessionEnd::Lost;
                    }
                    Err(_) => {
                        log::debug!("write to {peer} timed out");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}
