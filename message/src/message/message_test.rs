use super::*;

const MAX: usize = 4095 + HEADER_SIZE;

#[test]
fn test_message_marshal_round_trip() -> Result<()> {
    let payload = Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let m = Message::request(0x1234, 0x0421, 0x0001, 0x0001, 0x01, payload);

    let raw = m.marshal(MAX)?;
    assert_eq!(raw.len(), HEADER_SIZE + 10);
    assert_eq!(&raw[..4], &[0x12, 0x34, 0x04, 0x21]);
    assert_eq!(&raw[4..8], &[0x00, 0x00, 0x00, 0x12]);

    let parsed = Message::unmarshal(&raw)?;
    assert_eq!(parsed.header.service, m.header.service);
    assert_eq!(parsed.header.session, m.header.session);
    assert_eq!(parsed.payload, m.payload);

    Ok(())
}

#[test]
fn test_message_too_large() {
    let m = Message::request(
        0x1234,
        0x0421,
        0x0001,
        0x0001,
        0x01,
        Bytes::from(vec![0u8; MAX]),
    );
    assert_eq!(m.marshal(MAX), Err(Error::ErrMessageTooLarge));
}

#[test]
fn test_unmarshal_rejects_trailing_bytes() -> Result<()> {
    let m = Message::request(0x1234, 0x0421, 0x0001, 0x0002, 0x01, Bytes::new());
    let mut raw = BytesMut::from(&m.marshal(MAX)?[..]);
    raw.extend_from_slice(&[0xDE, 0xAD]);

    assert_eq!(
        Message::unmarshal(&raw.freeze()),
        Err(Error::ErrLengthMismatch)
    );
    Ok(())
}

#[test]
fn test_unmarshal_rejects_truncated_payload() -> Result<()> {
    let payload = Bytes::from_static(&[1, 2, 3, 4]);
    let m = Message::request(0x1234, 0x0421, 0x0001, 0x0003, 0x01, payload);
    let raw = m.marshal(MAX)?;
    let truncated = raw.slice(..raw.len() - 2);

    assert_eq!(
        Message::unmarshal(&truncated),
        Err(Error::ErrLengthMismatch)
    );
    Ok(())
}

#[test]
fn test_unmarshal_rejects_wrong_protocol_version() -> Result<()> {
    let m = Message::request(0x1234, 0x0421, 0x0001, 0x0004, 0x01, Bytes::new());
    let mut raw = BytesMut::from(&m.marshal(MAX)?[..]);
    raw[12] = 0x02;

    assert_eq!(
        Message::unmarshal(&raw.freeze()),
        Err(Error::ErrUnsupportedProtocolVersion(0x02))
    );
    Ok(())
}

#[test]
fn test_response_mirrors_request_id() {
    let req = Message::request(0x1234, 0x0421, 0x0001, 0x0042, 0x03, Bytes::new());
    let resp = Message::response_to(&req, Bytes::from_static(&[0xFF]));

    assert_eq!(resp.header.client, 0x0001);
    assert_eq!(resp.header.session, 0x0042);
    assert_eq!(resp.header.interface_version, 0x03);
    assert_eq!(resp.header.message_type, MessageType::Response);

    let err = Message::error_to(&req, ReturnCode::NotReachable);
    assert_eq!(err.header.message_type, MessageType::Error);
    assert_eq!(err.header.return_code, ReturnCode::NotReachable);
    assert_eq!(err.header.session, 0x0042);
    assert!(err.payload.is_empty());
}
