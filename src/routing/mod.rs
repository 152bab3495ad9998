//! The routing manager: per-host arbiter between local applications and the
//! network.
//!
//! One process per host (the one whose application name matches the
//! configured `routing` name) runs this component. It owns the local IPC
//! server socket, every wire endpoint, the service registry and the Service
//! Discovery engine. All mutations funnel through one mpsc channel into a
//! single task; I/O tasks (IPC connections, endpoints) only ever produce
//! events into that channel, which keeps the whole routing state free of
//! locks.


mod manager;

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::Result;
use crate::ipc::{FrameDecoder, IpcFrame};
use crate::policy::Credentials;

pub(crate) use manager::{reliability_to_u8, RoutingEvent};

/// Global operating state of the routing manager (settable by the daemon
/// owner; transitions are idempotent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingState {
    #[default]
    Running,
    Suspended,
    Resumed,
    Shutdown,
    Diagnosis,
    Unknown,
}

impl From<u8> for RoutingState {
    fn from(v: u8) -> Self {
        match v {
            0x00 => RoutingState::Running,
            0x01 => RoutingState::Suspended,
            0x02 => RoutingState::Resumed,
            0x03 => RoutingState::Shutdown,
            0x04 => RoutingState::Diagnosis,
            _ => RoutingState::Unknown,
        }
    }
}

impl From<RoutingState> for u8 {
    fn from(s: RoutingState) -> Self {
        match s {
            RoutingState::Running => 0x00,
            RoutingState::Suspended => 0x01,
            RoutingState::Resumed => 0x02,
            RoutingState::Shutdown => 0x03,
            RoutingState::Diagnosis => 0x04,
            RoutingState::Unknown => 0xFF,
        }
    }
}

impl fmt::Display for RoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Handle to a running routing manager.
pub struct RoutingManager {
    events_tx: mpsc::Sender<RoutingEvent>,
}

impl RoutingManager {
    /// Binds the IPC socket and spawns the routing task plus its acceptor.
    pub async fn start(config: Arc<Config>) -> Result<RoutingManager> {
        let socket_path = config.routing_socket();
        // a previous daemon instance may have left the socket behind
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(&socket_path)?;
        log::info!("routing manager listening on {}", socket_path.display());

        let (events_tx, events_rx) = mpsc::channel(256);

        tokio::spawn(accept_loop(listener, events_tx.clone()));
        tokio::spawn(manager::run(config, events_rx, events_tx.clone()));

        Ok(RoutingManager { events_tx })
    }

    /// Applies a routing state change (idempotent).
    pub async fn set_state(&self, state: RoutingState) {
        let _ = self
            .events_tx
            .send(RoutingEvent::SetState { state })
            .await;
    }

    /// Stops the routing task after emitting final StopOffers.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .events_tx
            .send(RoutingEvent::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

async fn accept_loop(listener: UnixListener, events_tx: mpsc::Sender<RoutingEvent>) {
    let mut next_conn: u64 = 1;
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("ipc accept failed: {e}");
                continue;
            }
        };

        let conn = next_conn;
        next_conn += 1;

        let creds = stream
            .peer_cred()
            .map(|c| Credentials {
                uid: c.uid(),
                gid: c.gid(),
            })
            .unwrap_or_default();

        let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(64);
        if events_tx
            .send(RoutingEvent::IpcOpened {
                conn,
                writer: writer_tx,
                creds,
            })
            .await
            .is_err()
        {
            return;
        }

        tokio::spawn(connection_loop(conn, stream, writer_rx, events_tx.clone()));
    }
}

/// Reader/writer loop of one attached application.
async fn connection_loop(
    conn: u64,
    mut stream: UnixStream,
    mut writer_rx: mpsc::Receiver<Bytes>,
    events_tx: mpsc::Sender<RoutingEvent>,
) {
    let (mut rd, mut wr) = stream.split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut decoder = FrameDecoder::default();

    loop {
        tokio::select! {
            res = rd.read_buf(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    match decoder.next_frame(&mut buf) {
                        Ok(Some(frame)) => {
                            if events_tx
                                .send(RoutingEvent::IpcFrame { conn, frame })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // framing violation: the channel is unusable
                            log::warn!("ipc framing error on connection {conn}: {e}");
                            let _ = events_tx.send(RoutingEvent::IpcClosed { conn }).await;
                            return;
                        }
                    }
                }
            }

            frame = writer_rx.recv() => {
                let Some(frame) = frame else { break };
                if wr.write_all(&frame).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = events_tx.send(RoutingEvent::IpcClosed { conn }).await;
}

/// Client side of the local IPC: connects and splits into a writer channel
/// plus an inbound frame channel. Used by [`crate::Application`].
pub(crate) async fn connect_ipc(
    config: &Config,
) -> Result<(mpsc::Sender<Bytes>, mpsc::Receiver<IpcFrame>)> {
    let stream = UnixStream::connect(config.routing_socket()).await?;
    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(64);
    let (frames_tx, frames_rx) = mpsc::channel::<IpcFrame>(64);

    tokio::spawn(client_loop(stream, writer_rx, frames_tx));
    Ok((writer_tx, frames_rx))
}

async fn client_loop(
    mut stream: UnixStream,
    mut writer_rx: mpsc::Receiver<Bytes>,
    frames_tx: mpsc::Sender<IpcFrame>,
) {
    let (mut rd, mut wr) = stream.split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut decoder = FrameDecoder::default();

    loop {
        tokio::select! {
            res = rd.read_buf(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                loop {
                    match decoder.next_frame(&mut buf) {
                        Ok(Some(frame)) => {
                            if frames_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::error!("ipc framing error from routing manager: {e}");
                            return;
                        }
                    }
                }
            }

            frame = writer_rx.recv() => {
                let Some(frame) = frame else { break };
                if wr.write_all(&frame).await.is_err() {
                    break;
                }
            }
        }
    }
}
