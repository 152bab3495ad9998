use bytes::Bytes;
use tokio::net::TcpListener;

use super::*;

fn config(remote: SocketAddr) -> TcpClientConfig {
    TcpClientConfig {
        remote,
        max_reconnect_backoff: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn read_frame(stream: &mut TcpStream, max: usize) -> Message {
    let mut buf = BytesMut::new();
    let mut decoder = StreamDecoder::new(false, max);
    loop {
        if let Some(m) = decoder.next_frame(&mut buf).unwrap() {
            return m;
        }
        if stream.read_buf(&mut buf).await.unwrap() == 0 {
            panic!("peer closed before a full frame arrived");
        }
    }
}

#[tokio::test]
async fn test_connect_and_send() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let client = TcpClient::start(1, config(addr), events_tx);

    let msg = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from_static(&[1, 2, 3]));
    // enqueue before the connection is up; the frame goes out once connected
    client.send(&msg).unwrap();

    let (mut peer, _) = listener.accept().await.unwrap();
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Connected { endpoint: 1, .. } => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    let received = read_frame(&mut peer, client.config.max_message_size).await;
    assert_eq!(received.header.session, 1);
    assert_eq!(received.payload, msg.payload);

    client.close().await;
    let mut state = client.state();
    while state != EndpointState::Closed {
        state = client.state_changed(state).await;
    }
}

#[tokio::test]
async fn test_receive_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let client = TcpClient::start(2, config(addr), events_tx);

    let (mut peer, _) = listener.accept().await.unwrap();
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Connected { .. } => {}
        other => panic!("expected Connected, got {other:?}"),
    }

    let max = crate::DEFAULT_MAX_MESSAGE_SIZE_RELIABLE;
    let a = Message::request(0x1234, 0x0421, 1, 10, 1, Bytes::from_static(&[0xAA]));
    let b = Message::request(0x1234, 0x0421, 1, 11, 1, Bytes::from_static(&[0xBB]));
    peer.write_all(&a.marshal(max).unwrap()).await.unwrap();
    peer.write_all(&b.marshal(max).unwrap()).await.unwrap();

    for expected in [10u16, 11] {
        match events_rx.recv().await.unwrap() {
            EndpointEvent::Frame { message, .. } => {
                assert_eq!(message.header.session, expected);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    client.close().await;
}

#[tokio::test]
async fn test_reconnect_after_peer_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let client = TcpClient::start(3, config(addr), events_tx);

    let (peer, _) = listener.accept().await.unwrap();
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Connected { .. } => {}
        other => panic!("{other:?}"),
    }

    drop(peer);
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Disconnected { .. } => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }

    // the driver dials again after its backoff
    let (_peer2, _) = listener.accept().await.unwrap();
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Connected { .. } => {}
        other => panic!("expected reconnect, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn test_corrupt_stream_without_cookies_resets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let client = TcpClient::start(4, config(addr), events_tx);

    let (mut peer, _) = listener.accept().await.unwrap();
    match events_rx.recv().await.unwrap() {
        EndpointEvent::Connected { .. } => {}
        other => panic!("{other:?}"),
    }

    // length field below minimum: unrecoverable without cookies
    let mut garbage = [0u8; 24];
    garbage[7] = 0x02;
    peer.write_all(&garbage).await.unwrap();

    let mut saw_codec_error = false;
    loop {
        match events_rx.recv().await.unwrap() {
            EndpointEvent::CodecError { .. } => saw_codec_error = true,
            EndpointEvent::Disconnected { .. } => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(saw_codec_error);

    client.close().await;
}
