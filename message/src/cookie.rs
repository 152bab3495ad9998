//! Magic Cookie frames.
//!
//! Magic Cookies are reserved 16 byte SOME/IP messages interleaved into TCP
//! streams as resynchronization markers. A receiver that lost framing scans
//! forward for the next cookie and resumes parsing behind it.

use crate::header::HEADER_SIZE;

/// Cookie sent in client-to-service direction.
pub const CLIENT_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x01, 0x00,
];

/// Cookie sent in service-to-client direction.
pub const SERVICE_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x02, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
    Client,
    Service,
}

/// Checks whether `b` starts with a Magic Cookie frame.
pub fn cookie_at_start(b: &[u8]) -> Option<CookieKind> {
    if b.len() < HEADER_SIZE {
        return None;
    }
    if b[..HEADER_SIZE] == CLIENT_COOKIE {
        Some(CookieKind::Client)
    } else if b[..HEADER_SIZE] == SERVICE_COOKIE {
        Some(CookieKind::Service)
    } else {
        None
    }
}

/// Scans `b` for the next Magic Cookie of either kind, starting at `from`.
///
/// Returns the byte offset of the cookie start. A trailing partial cookie
/// prefix is not reported; callers keep the tail buffered and retry once
/// more bytes arrive.
pub fn find_cookie(b: &[u8], from: usize) -> Option<usize> {
    if b.len() < from + HEADER_SIZE {
        return None;
    }
    (from..=b.len() - HEADER_SIZE).find(|&i| cookie_at_start(&b[i..]).is_some())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cookie_detection() {
        assert_eq!(cookie_at_start(&CLIENT_COOKIE), Some(CookieKind::Client));
        assert_eq!(cookie_at_start(&SERVICE_COOKIE), Some(CookieKind::Service));
        assert_eq!(cookie_at_start(&CLIENT_COOKIE[..12]), None);

        let mut garbled = CLIENT_COOKIE;
        garbled[8] = 0x00;
        assert_eq!(cookie_at_start(&garbled), None);
    }

    #[test]
    fn test_find_cookie() {
        let mut stream = vec![0xAAu8; 25];
        stream.extend_from_slice(&SERVICE_COOKIE);
        stream.extend_from_slice(&[0x01, 0x02]);

        assert_eq!(find_cookie(&stream, 0), Some(25));
        assert_eq!(find_cookie(&stream, 26), None);
        assert_eq!(find_cookie(&[0u8; 4], 0), None);
    }
}
