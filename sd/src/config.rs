use std::net::Ipv4Addr;
use std::time::Duration;

use message::Ttl;

/// Which transport classes an event, eventgroup or service leg uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    Reliable,
    #[default]
    Unreliable,
    Both,
    Unknown,
}

impl Reliability {
    /// Whether a subscriber asking for `proto` is compatible.
    pub fn accepts(&self, proto: message::sd::L4Proto) -> bool {
        match (self, proto) {
            (Reliability::Reliable, message::sd::L4Proto::Tcp) => true,
            (Reliability::Unreliable, message::sd::L4Proto::Udp) => true,
            (Reliability::Both, _) => true,
            (Reliability::Unknown, _) => true,
            _ => false,
        }
    }
}

/// Service Discovery timing and addressing, with the AUTOSAR defaults the
/// daemon ships with.
#[derive(Debug, Clone)]
pub struct SdConfig {
    pub multicast: Ipv4Addr,
    pub port: u16,
    /// Address advertised in endpoint options of our offers.
    pub unicast: Ipv4Addr,
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,
    pub repetitions_max: u32,
    pub repetitions_base_delay: Duration,
    pub cyclic_offer_delay: Duration,
    pub request_response_delay: Duration,
    /// TTL announced in offers and subscribe acks.
    pub ttl: Ttl,
}

impl Default for SdConfig {
    fn default() -> Self {
        SdConfig {
            multicast: Ipv4Addr::new(224, 0, 0, 0),
            port: 30490,
            unicast: Ipv4Addr::UNSPECIFIED,
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(100),
            repetitions_max: 3,
            repetitions_base_delay: Duration::from_millis(200),
            cyclic_offer_delay: Duration::from_secs(2),
            request_response_delay: Duration::from_millis(30),
            ttl: 0xFF_FFFF,
        }
    }
}
