use super::*;

fn round_trip(command: Command) {
    let raw = encode_frame(0x1343, &command);
    let mut buf = BytesMut::from(&raw[..]);
    let mut decoder = FrameDecoder::default();
    let frame = decoder.next_frame(&mut buf).unwrap().unwrap();
    assert_eq!(frame.client, 0x1343);
    assert_eq!(frame.command, command);
    assert!(buf.is_empty());
}

#[test]
fn test_command_round_trips() {
    round_trip(Command::RegisterApplication {
        name: "brake-ctrl".to_owned(),
        requested_client: 0x1343,
    });
    round_trip(Command::DeregisterApplication);
    round_trip(Command::ApplicationInfo {
        assigned_client: 0x1343,
        peers: vec![(0x1344, "door-left".to_owned()), (0x1345, "hmi".to_owned())],
    });
    round_trip(Command::ApplicationLost { client: 0x1344 });
    round_trip(Command::RequestService {
        service: 0x1234,
        instance: 0x5678,
        major: 0x01,
        minor: 0x0000_0002,
    });
    round_trip(Command::ProvideService {
        service: 0x1234,
        instance: 0x5678,
        major: 0x01,
        minor: 0,
        reliable_port: 30509,
        unreliable_port: 0,
    });
    round_trip(Command::ProvideEventgroup {
        service: 0x1234,
        instance: 0x5678,
        eventgroup: 0x1000,
        reliability: 1,
        multicast_addr: u32::from(std::net::Ipv4Addr::new(224, 225, 226, 233)),
        multicast_port: 32344,
    });
    round_trip(Command::AddField {
        service: 0x1234,
        instance: 0x5678,
        event: 0x8001,
        eventgroups: vec![0x1000, 0x1001],
        cycle_ms: 500,
        change_resets_cycle: true,
        payload: Bytes::from_static(&[1, 2, 3, 4]),
    });
    round_trip(Command::Send {
        instance: 0x5678,
        data: Bytes::from_static(&[0x12, 0x34, 0x04, 0x21, 0, 0, 0, 8, 0, 1, 0, 1, 1, 1, 0, 0]),
    });
    round_trip(Command::Notify {
        instance: 0x5678,
        force: true,
        data: Bytes::from_static(&[9, 9, 9]),
    });
    round_trip(Command::NotifyOne {
        instance: 0x5678,
        target: 0x1344,
        force: false,
        data: Bytes::from_static(&[7]),
    });
    round_trip(Command::Subscribe {
        service: 0x1234,
        instance: 0x5678,
        eventgroup: 0x1000,
        major: 0x01,
        ttl: 16,
        subscriber: 0x1344,
        pending_id: 77,
    });
    round_trip(Command::SubscribeAck {
        service: 0x1234,
        instance: 0x5678,
        eventgroup: 0x1000,
        subscriber: 0x1344,
        pending_id: 77,
    });
    round_trip(Command::OfferedServicesResponse {
        services: vec![(0x1234, 0x5678), (0x1122, 0x0001)],
    });
    round_trip(Command::Ping);
    round_trip(Command::Pong);
    round_trip(Command::UpdateSecurityPolicy {
        uid: 1000,
        gid: 1000,
        rights: PolicyRights {
            requests: vec![ServiceRight {
                service: 0x1234,
                instances: vec![IdRange::single(0x5678)],
                methods: vec![IdRange { first: 1, last: 100 }],
            }],
            offers: vec![],
        },
    });
    round_trip(Command::RoutingState {
        state: RoutingState::Suspended,
    });
}

#[test]
fn test_payload_size_is_little_endian() {
    let raw = encode_frame(
        0x0001,
        &Command::Send {
            instance: 0x5678,
            data: Bytes::from_static(&[0u8; 0x0102]),
        },
    );
    // payload = instance (2) + length prefix (4) + 0x0102 data bytes
    let expected = 2 + 4 + 0x0102u32;
    assert_eq!(&raw[7..11], &expected.to_le_bytes());
}

#[test]
fn test_partial_frames_wait_for_more() {
    let raw = encode_frame(0x0001, &Command::Ping);
    let mut decoder = FrameDecoder::default();

    let mut buf = BytesMut::from(&raw[..5]);
    assert!(decoder.next_frame(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&raw[5..raw.len() - 1]);
    assert!(decoder.next_frame(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&raw[raw.len() - 1..]);
    assert!(decoder.next_frame(&mut buf).unwrap().is_some());
}

#[test]
fn test_bad_start_tag_is_fatal() {
    let mut raw = BytesMut::from(&encode_frame(0x0001, &Command::Ping)[..]);
    raw[0] = 0x00;
    let mut decoder = FrameDecoder::default();
    assert!(matches!(
        decoder.next_frame(&mut raw),
        Err(Error::ErrIpcFraming)
    ));
}

#[test]
fn test_bad_end_tag_is_fatal() {
    let mut raw = BytesMut::from(&encode_frame(0x0001, &Command::Pong)[..]);
    let len = raw.len();
    raw[len - 1] = 0xFF;
    let mut decoder = FrameDecoder::default();
    assert!(matches!(
        decoder.next_frame(&mut raw),
        Err(Error::ErrIpcFraming)
    ));
}

#[test]
fn test_unknown_command_rejected() {
    let mut raw = BytesMut::from(&encode_frame(0x0001, &Command::Ping)[..]);
    raw[6] = 0x7F;
    let mut decoder = FrameDecoder::default();
    assert!(matches!(
        decoder.next_frame(&mut raw),
        Err(Error::ErrUnknownCommand(0x7F))
    ));
}

#[test]
fn test_truncated_payload_rejected() {
    // a Send command whose payload announces more bytes than present
    let mut out = BytesMut::new();
    out.put_slice(&START_TAG);
    out.put_u16_le(0x0001);
    out.put_u8(0x13);
    out.put_u32_le(6);
    out.put_u16_le(0x5678); // instance
    out.put_u32_le(100); // data length that is not there
    out.put_slice(&END_TAG);

    let mut decoder = FrameDecoder::default();
    assert!(matches!(
        decoder.next_frame(&mut out),
        Err(Error::ErrIpcPayload)
    ));
}
