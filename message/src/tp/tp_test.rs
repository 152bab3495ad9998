use super::*;
use crate::header::MessageType;

fn big_request(len: usize) -> Message {
    let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    Message::request(0x1234, 0x0421, 0x0001, 0x0001, 0x01, Bytes::from(payload))
}

#[test]
fn test_tp_header_round_trip() -> Result<()> {
    let h = TpHeader {
        offset: 0x10,
        more: true,
    };
    let mut out = BytesMut::new();
    h.marshal_to(&mut out);
    assert_eq!(&out[..], &[0x00, 0x00, 0x00, 0x11]);

    let parsed = TpHeader::unmarshal(&mut out.freeze())?;
    assert_eq!(parsed, h);
    Ok(())
}

#[test]
fn test_segment_alignment_and_flags() -> Result<()> {
    let m = big_request(100);
    // 64 byte wire budget: 64 - 16 - 4 = 44 -> 32 byte chunks
    let segments = segment(&m, 64)?;
    assert_eq!(segments.len(), 4); // 32 + 32 + 32 + 4

    for (i, s) in segments.iter().enumerate() {
        assert_eq!(s.header.message_type, MessageType::TpRequest);
        let mut p = s.payload.clone();
        let tp = TpHeader::unmarshal(&mut p)?;
        assert_eq!(tp.offset as usize, i * 32);
        assert_eq!(tp.more, i < 3);
        if tp.more {
            assert_eq!(p.len() % TP_ALIGNMENT, 0);
        }
    }
    Ok(())
}

#[test]
fn test_segment_budget_too_small() {
    let m = big_request(100);
    assert_eq!(segment(&m, 24), Err(Error::ErrTpBudgetTooSmall));
}

// Round trip law: reassemble(segment(m, mtu)) == m.
#[test]
fn test_segment_reassemble_round_trip() -> Result<()> {
    let m = big_request(614_400);
    let segments = segment(&m, 1400)?;
    assert!(segments.len() > 1);

    let mut r = Reassembler::new(1 << 20);
    let mut out = None;
    for s in &segments {
        assert!(out.is_none());
        out = r.push(s)?;
    }

    let reassembled = out.expect("final segment completes the message");
    assert_eq!(reassembled.header.message_type, MessageType::Request);
    assert_eq!(reassembled.header.session, m.header.session);
    assert_eq!(reassembled.payload, m.payload);
    Ok(())
}

#[test]
fn test_reassembler_rejects_gap() -> Result<()> {
    let m = big_request(200);
    let segments = segment(&m, 80)?;
    assert!(segments.len() >= 3);

    let mut r = Reassembler::new(1 << 20);
    assert!(r.push(&segments[0])?.is_none());
    // skipping a segment is a gap
    assert_eq!(r.push(&segments[2]), Err(Error::ErrTpSegmentGap));
    Ok(())
}

#[test]
fn test_reassembler_rejects_replay() -> Result<()> {
    let m = big_request(200);
    let segments = segment(&m, 80)?;

    let mut r = Reassembler::new(1 << 20);
    assert!(r.push(&segments[0])?.is_none());
    assert_eq!(r.push(&segments[0]), Err(Error::ErrTpSegmentGap));
    Ok(())
}

#[test]
fn test_reassembler_enforces_max_size() -> Result<()> {
    let m = big_request(512);
    let segments = segment(&m, 144)?;

    let mut r = Reassembler::new(256);
    let mut result = Ok(None);
    for s in &segments {
        result = r.push(s);
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result, Err(Error::ErrTpTooLarge));
    Ok(())
}

#[test]
fn test_reassembler_rejects_plain_message() {
    let m = big_request(4);
    let mut r = Reassembler::new(1 << 20);
    assert_eq!(r.push(&m), Err(Error::ErrNotTp));
}
