use bytes::Bytes;

use super::*;
use crate::cookie::{CLIENT_COOKIE, SERVICE_COOKIE};
use crate::header::{MessageType, ReturnCode};

const MAX: usize = 4095 + HEADER_SIZE;

fn request(session: u16, payload: &'static [u8]) -> Message {
    Message::request(0x1234, 0x0421, 0x0001, session, 0x01, Bytes::from_static(payload))
}

#[test]
fn test_decode_single_frame() -> Result<()> {
    let m = request(0x0001, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let raw = m.marshal(MAX)?;

    match decode(&raw, MAX) {
        DecodeOutcome::Frame { message, consumed } => {
            assert_eq!(consumed, raw.len());
            assert_eq!(message.header.session, 0x0001);
            assert_eq!(message.payload.len(), 10);
        }
        other => panic!("expected frame, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_decode_partial() -> Result<()> {
    let raw = request(0x0001, &[1, 2, 3, 4]).marshal(MAX)?;

    assert_eq!(decode(&raw[..7], MAX), DecodeOutcome::Partial { needed: 9 });
    assert_eq!(
        decode(&raw[..raw.len() - 1], MAX),
        DecodeOutcome::Partial { needed: 1 }
    );
    Ok(())
}

#[test]
fn test_decode_cookie_and_corrupt() {
    assert_eq!(
        decode(&CLIENT_COOKIE, MAX),
        DecodeOutcome::Cookie {
            kind: crate::cookie::CookieKind::Client
        }
    );

    // length field of 4 is below the fixed tail
    let mut bad = CLIENT_COOKIE;
    bad[2] = 0x11; // no longer a cookie
    bad[7] = 0x04;
    assert_eq!(decode(&bad, MAX), DecodeOutcome::Corrupt);

    // oversize length field
    let mut oversize = CLIENT_COOKIE;
    oversize[2] = 0x11;
    oversize[4] = 0xFF;
    assert_eq!(decode(&oversize, MAX), DecodeOutcome::Corrupt);
}

#[test]
fn test_stream_decoder_multiple_frames() -> Result<()> {
    let a = request(0x0001, &[1, 2, 3]).marshal(MAX)?;
    let b = request(0x0002, &[4, 5, 6, 7]).marshal(MAX)?;

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&a);
    buf.extend_from_slice(&b);

    let mut dec = StreamDecoder::new(false, MAX);
    let first = dec.next_frame(&mut buf)?.expect("first frame");
    let second = dec.next_frame(&mut buf)?.expect("second frame");
    assert_eq!(first.header.session, 0x0001);
    assert_eq!(second.header.session, 0x0002);
    assert!(dec.next_frame(&mut buf)?.is_none());
    assert!(buf.is_empty());
    Ok(())
}

#[test]
fn test_stream_decoder_skips_cookies() -> Result<()> {
    let m = request(0x0003, &[9, 9]).marshal(MAX)?;

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&CLIENT_COOKIE);
    buf.extend_from_slice(&m);

    let mut dec = StreamDecoder::new(true, MAX);
    let frame = dec.next_frame(&mut buf)?.expect("frame behind cookie");
    assert_eq!(frame.header.session, 0x0003);
    assert_eq!(dec.resyncs(), 0);
    Ok(())
}

// Magic Cookie resync: valid request, 25 bytes of garbage, cookie, valid
// request. The decoder recovers the second request.
#[test]
fn test_stream_decoder_resyncs_on_garbage() -> Result<()> {
    let first = request(0x0010, &[1]).marshal(MAX)?;
    let second = request(0x0011, &[2]).marshal(MAX)?;

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&[0xA5; 25]);
    buf.extend_from_slice(&CLIENT_COOKIE);
    buf.extend_from_slice(&second);

    let mut dec = StreamDecoder::new(true, MAX);
    let a = dec.next_frame(&mut buf)?.expect("first request");
    assert_eq!(a.header.session, 0x0010);

    let b = dec.next_frame(&mut buf)?.expect("resynced request");
    assert_eq!(b.header.session, 0x0011);
    assert_eq!(dec.resyncs(), 1);
    assert!(buf.is_empty());
    Ok(())
}

#[test]
fn test_stream_decoder_garbage_without_cookie_keeps_tail() -> Result<()> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0xA5; 64]);
    // a cookie prefix that is still incomplete
    buf.extend_from_slice(&SERVICE_COOKIE[..10]);

    let mut dec = StreamDecoder::new(true, MAX);
    assert!(dec.next_frame(&mut buf)?.is_none());
    assert_eq!(buf.len(), HEADER_SIZE - 1);

    // once the rest of the cookie and a frame arrive, decoding resumes
    buf.extend_from_slice(&SERVICE_COOKIE[10..]);
    let m = request(0x0020, &[7]).marshal(MAX)?;
    buf.extend_from_slice(&m);

    let frame = dec.next_frame(&mut buf)?.expect("frame after late cookie");
    assert_eq!(frame.header.session, 0x0020);
    Ok(())
}

#[test]
fn test_stream_decoder_corrupt_without_cookies_errors() {
    let mut buf = BytesMut::new();
    let mut bad = [0u8; 24];
    bad[7] = 0x02; // length 2 < 8
    buf.extend_from_slice(&bad);

    let mut dec = StreamDecoder::new(false, MAX);
    assert_eq!(dec.next_frame(&mut buf), Err(Error::ErrCorruptFrame));
}

#[test]
fn test_decoded_frame_types_survive() -> Result<()> {
    let mut m = request(0x0030, &[]);
    m.header.message_type = MessageType::Error;
    m.header.return_code = ReturnCode::UnknownMethod;
    let raw = m.marshal(MAX)?;

    let mut buf = BytesMut::from(&raw[..]);
    let mut dec = StreamDecoder::new(false, MAX);
    let parsed = dec.next_frame(&mut buf)?.expect("frame");
    assert_eq!(parsed.header.message_type, MessageType::Error);
    assert_eq!(parsed.header.return_code, ReturnCode::UnknownMethod);
    Ok(())
}
