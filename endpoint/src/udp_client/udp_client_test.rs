use super::*;

async fn pair() -> (UdpClient, UdpSocket, mpsc::Receiver<EndpointEvent>) {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let config = UdpClientConfig {
        local: "127.0.0.1:0".parse().unwrap(),
        remote: peer_addr,
        tp_enabled: true,
        ..Default::default()
    };

    let (events_tx, events_rx) = mpsc::channel(64);
    let client = UdpClient::start(1, config, events_tx).await.unwrap();
    (client, peer, events_rx)
}

async fn expect_connected(events: &mut mpsc::Receiver<EndpointEvent>) {
    match events.recv().await.unwrap() {
        EndpointEvent::Connected { endpoint: 1, .. } => {}
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_single_datagram() {
    let (client, peer, mut events) = pair().await;
    expect_connected(&mut events).await;

    let msg = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from_static(&[1, 2, 3]));
    client.send(&msg).unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
    let received = Message::unmarshal(&Bytes::copy_from_slice(&buf[..n])).unwrap();
    assert_eq!(received, msg);

    client.close().await;
}

#[tokio::test]
async fn test_send_segments_large_message() {
    let (client, peer, mut events) = pair().await;
    expect_connected(&mut events).await;

    let payload: Vec<u8> = (0..4000).map(|i| (i % 256) as u8).collect();
    let msg = Message::request(0x1234, 0x0421, 1, 2, 1, Bytes::from(payload));
    client.send(&msg).unwrap();

    let mut buf = vec![0u8; 2048];
    let mut count = 0;
    let mut last_type = message::MessageType::Request;
    loop {
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let seg = Message::unmarshal(&Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert!(seg.header.message_type.is_tp());
        last_type = seg.header.message_type;
        count += 1;
        let mut p = seg.payload.clone();
        let tp_header = tp::TpHeader::unmarshal(&mut p).unwrap();
        if !tp_header.more {
            break;
        }
    }
    assert!(count > 1);
    assert_eq!(last_type, message::MessageType::TpRequest);

    client.close().await;
}

#[tokio::test]
async fn test_receive_and_reassemble() {
    let (client, peer, mut events) = pair().await;
    expect_connected(&mut events).await;

    // learn the client's address by receiving one message first
    let probe = Message::request(0x1234, 0x0001, 1, 1, 1, Bytes::new());
    client.send(&probe).unwrap();
    let mut buf = vec![0u8; 2048];
    let (_, client_addr) = peer.recv_from(&mut buf).await.unwrap();

    let payload: Vec<u8> = (0..4000).map(|i| (i % 256) as u8).collect();
    let big = Message::request(0x1234, 0x0421, 1, 5, 1, Bytes::from(payload));
    for seg in tp::segment(&big, crate::DEFAULT_UDP_MTU).unwrap() {
        let raw = seg.marshal(crate::DEFAULT_UDP_MTU).unwrap();
        peer.send_to(&raw, client_addr).await.unwrap();
    }

    loop {
        match events.recv().await.unwrap() {
            EndpointEvent::Frame { message, .. } => {
                assert_eq!(message.header.session, 5);
                assert_eq!(message.payload, big.payload);
                assert_eq!(message.header.message_type, message::MessageType::Request);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    client.close().await;
}

#[tokio::test]
async fn test_oversize_without_tp_rejected() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = UdpClientConfig {
        local: "127.0.0.1:0".parse().unwrap(),
        remote: peer.local_addr().unwrap(),
        tp_enabled: false,
        ..Default::default()
    };

    let (events_tx, _events_rx) = mpsc::channel(16);
    let client = UdpClient::start(2, config, events_tx).await.unwrap();

    let msg = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from(vec![0u8; 4000]));
    assert_eq!(client.send(&msg), Err(Error::ErrMessageTooLarge));

    client.close().await;
}

#[tokio::test]
async fn test_malformed_datagram_surfaces_codec_error() {
    let (client, peer, mut events) = pair().await;
    expect_connected(&mut events).await;

    let probe = Message::request(0x1234, 0x0001, 1, 1, 1, Bytes::new());
    client.send(&probe).unwrap();
    let mut buf = vec![0u8; 64];
    let (_, client_addr) = peer.recv_from(&mut buf).await.unwrap();

    peer.send_to(&[0x01, 0x02, 0x03], client_addr).await.unwrap();

    match events.recv().await.unwrap() {
        EndpointEvent::CodecError { endpoint: 1, .. } => {}
        other => panic!("expected CodecError, got {other:?}"),
    }

    client.close().await;
}
