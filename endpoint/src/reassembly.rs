use std::collections::HashMap;
use std::net::SocketAddr;

use message::tp::Reassembler;
use message::Message;

use crate::error::Result;

/// Reassembly buffers for inbound SOME/IP-TP traffic.
///
/// Buffers are keyed by (sender, message id, request id); a segment stream
/// that violates the reassembler's ordering rules drops only its own key.
#[derive(Debug)]
pub struct ReassemblyMap {
    max_tp_size: usize,
    pending: HashMap<(SocketAddr, u32, u32), Reassembler>,
}

impl ReassemblyMap {
    pub fn new(max_tp_size: usize) -> Self {
        ReassemblyMap {
            max_tp_size,
            pending: HashMap::new(),
        }
    }

    /// Feeds one inbound message. Non-TP messages pass through untouched;
    /// TP segments are absorbed until their final segment completes.
    pub fn process(&mut self, peer: SocketAddr, msg: Message) -> Result<Option<Message>> {
        if !msg.header.message_type.is_tp() {
            return Ok(Some(msg));
        }

        let key = (peer, msg.header.message_id(), msg.header.request_id());
        let reassembler = self
            .pending
            .entry(key)
            .or_insert_with(|| Reassembler::new(self.max_tp_size));

        match reassembler.push(&msg) {
            Ok(Some(complete)) => {
                self.pending.remove(&key);
                Ok(Some(complete))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.pending.remove(&key);
                Err(e.into())
            }
        }
    }

    /// Drops every pending reassembly from `peer`.
    pub fn clear_peer(&mut self, peer: SocketAddr) {
        self.pending.retain(|(p, _, _), _| *p != peer);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use message::tp;

    use super::*;

    fn peer() -> SocketAddr {
        "192.168.0.9:30509".parse().unwrap()
    }

    #[test]
    fn test_passthrough_and_reassembly() -> Result<()> {
        let mut map = ReassemblyMap::new(1 << 20);

        let plain = Message::request(0x1234, 0x0421, 1, 1, 1, Bytes::from_static(&[1, 2]));
        assert_eq!(map.process(peer(), plain.clone())?, Some(plain));

        let payload: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();
        let big = Message::request(0x1234, 0x0421, 1, 2, 1, Bytes::from(payload));
        let segments = tp::segment(&big, 1400)?;

        let mut out = None;
        for s in segments {
            out = map.process(peer(), s)?;
        }
        let complete = out.expect("reassembled");
        assert_eq!(complete.payload, big.payload);
        assert_eq!(map.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_gap_drops_single_key() -> Result<()> {
        let mut map = ReassemblyMap::new(1 << 20);

        let payload: Vec<u8> = vec![7; 4000];
        let big = Message::request(0x1234, 0x0421, 1, 3, 1, Bytes::from(payload));
        let segments = tp::segment(&big, 1400)?;

        assert!(map.process(peer(), segments[0].clone())?.is_none());
        assert!(map.process(peer(), segments[2].clone()).is_err());
        assert_eq!(map.pending(), 0);
        Ok(())
    }
}
