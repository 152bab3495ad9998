use std::net::Ipv4Addr;

use super::*;

fn offer_with_endpoints() -> Entry {
    Entry::offer_service(
        0x1122,
        0x0001,
        0x01,
        0x0000_0002,
        3,
        vec![
            SdOption::Ipv4Endpoint {
                addr: Ipv4Addr::new(192, 168, 0, 7),
                proto: L4Proto::Tcp,
                port: 30509,
            },
            SdOption::Ipv4Endpoint {
                addr: Ipv4Addr::new(192, 168, 0, 7),
                proto: L4Proto::Udp,
                port: 30509,
            },
        ],
    )
}

#[test]
fn test_sd_round_trip() -> Result<()> {
    let mut sd = SdMessage::new(true);
    sd.entries.push(offer_with_endpoints());
    sd.entries.push(Entry::find_service(
        0x3344,
        ANY_INSTANCE,
        ANY_MAJOR,
        ANY_MINOR,
        DEFAULT_TTL,
    ));
    sd.entries.push(Entry::subscribe(
        0x1122,
        0x0001,
        0x1000,
        0x01,
        0,
        3,
        vec![SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 168, 0, 9),
            proto: L4Proto::Udp,
            port: 40002,
        }],
    ));

    let raw = sd.marshal()?;
    let parsed = SdMessage::unmarshal(&raw)?;
    assert_eq!(parsed, sd);
    Ok(())
}

#[test]
fn test_sd_option_run_sharing() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(offer_with_endpoints());
    sd.entries.push(offer_with_endpoints());

    let raw = sd.marshal()?;
    // both entries reference the same run: 8 byte prefix + 2 entries +
    // 4 byte options length + exactly one run of two ipv4 options
    assert_eq!(raw.len(), 8 + 2 * ENTRY_SIZE + 4 + 2 * 12);

    let parsed = SdMessage::unmarshal(&raw)?;
    assert_eq!(parsed.entries[0].options, parsed.entries[1].options);
    Ok(())
}

#[test]
fn test_sd_flags() -> Result<()> {
    let mut sd = SdMessage::new(true);
    sd.unicast = true;
    let raw = sd.marshal()?;
    assert_eq!(raw[0], FLAG_REBOOT | FLAG_UNICAST);

    let parsed = SdMessage::unmarshal(&raw)?;
    assert!(parsed.reboot);
    assert!(parsed.unicast);
    Ok(())
}

#[test]
fn test_sd_carrier_message() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(offer_with_endpoints());

    let msg = sd.to_message(0x0007)?;
    assert_eq!(msg.header.service, SD_SERVICE);
    assert_eq!(msg.header.method, SD_METHOD);
    assert_eq!(msg.header.session, 0x0007);
    assert!(is_sd_message(&msg));

    let back = SdMessage::from_message(&msg)?;
    assert_eq!(back, sd);
    Ok(())
}

#[test]
fn test_sd_rejects_truncated() {
    let sd = {
        let mut m = SdMessage::new(false);
        m.entries.push(offer_with_endpoints());
        m
    };
    let raw = sd.marshal().unwrap();

    for cut in [2, SD_PREFIX_SIZE + 3, raw.len() - 1] {
        assert_eq!(
            SdMessage::unmarshal(&raw.slice(..cut)),
            Err(Error::ErrSdMalformed),
            "cut at {cut}"
        );
    }
}

#[test]
fn test_sd_bad_option_reference_drops_entry_only() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(offer_with_endpoints());
    sd.entries.push(Entry::find_service(0x3344, 0x0001, 1, 0, 3));
    let mut raw = BytesMut::from(&sd.marshal()?[..]);

    // first entry's option count now points past the options array
    raw[8 + 3] = 0x40;

    let parsed = SdMessage::unmarshal(&raw.freeze())?;
    assert_eq!(parsed.rejected_entries, 1);
    assert_eq!(parsed.entries.len(), 1);
    assert_eq!(parsed.entries[0].service, 0x3344);
    Ok(())
}

#[test]
fn test_sd_unknown_entry_type_drops_entry_only() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(Entry::find_service(0x3344, 0x0001, 1, 0, 3));
    sd.entries.push(Entry::find_service(0x5566, 0x0001, 1, 0, 3));
    let mut raw = BytesMut::from(&sd.marshal()?[..]);

    raw[8] = 0x7F; // first entry type unknown

    let parsed = SdMessage::unmarshal(&raw.freeze())?;
    assert_eq!(parsed.rejected_entries, 1);
    assert_eq!(parsed.entries.len(), 1);
    assert_eq!(parsed.entries[0].service, 0x5566);
    Ok(())
}

#[test]
fn test_configuration_option_round_trip() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(Entry::offer_service(
        0x1122,
        0x0001,
        1,
        0,
        3,
        vec![SdOption::Configuration(vec![
            ("name".to_owned(), "brake-ctrl".to_owned()),
            ("zone".to_owned(), "front".to_owned()),
        ])],
    ));

    let raw = sd.marshal()?;
    let parsed = SdMessage::unmarshal(&raw)?;
    assert_eq!(parsed, sd);
    Ok(())
}

#[test]
fn test_unknown_option_preserved() -> Result<()> {
    let mut sd = SdMessage::new(false);
    sd.entries.push(Entry::offer_service(
        0x1122,
        0x0001,
        1,
        0,
        3,
        vec![SdOption::Unknown {
            option_type: 0x3F,
            body: Bytes::from_static(&[1, 2, 3]),
        }],
    ));

    let raw = sd.marshal()?;
    let parsed = SdMessage::unmarshal(&raw)?;
    assert_eq!(parsed, sd);
    Ok(())
}

#[test]
fn test_stop_entries() {
    let stop = Entry::stop_offer_service(0x1122, 0x0001, 1, 0);
    assert!(stop.is_stop());
    assert_eq!(stop.entry_type, EntryType::OfferService);

    let sub = Entry::subscribe(0x1122, 0x0001, 0x1000, 1, 0, 16, vec![]);
    assert!(!sub.is_stop());
    assert_eq!(sub.eventgroup(), Some(0x1000));
}
