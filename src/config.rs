use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

fn default_routing_name() -> String {
    "routingmanagerd".to_owned()
}

fn default_ipc_base() -> PathBuf {
    PathBuf::from("/tmp/someip-0")
}

fn default_unicast() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

/// One statically configured service instance: which ports a local offer
/// binds, or where a remote instance lives when discovery is disabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: u16,
    pub instance: u16,
    pub reliable_port: Option<u16>,
    pub unreliable_port: Option<u16>,
    /// Remote address for discovery-less setups.
    pub unicast: Option<Ipv4Addr>,
    /// Enable Magic Cookies on the reliable leg.
    pub magic_cookies: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            service: 0,
            instance: 0,
            reliable_port: None,
            unreliable_port: None,
            unicast: None,
            magic_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Requested client id; the routing manager assigns one when absent or
    /// taken.
    pub id: Option<u16>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            name: String::new(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SdSection {
    pub enable: bool,
    pub multicast: Ipv4Addr,
    pub port: u16,
    pub initial_delay_min_ms: u64,
    pub initial_delay_max_ms: u64,
    pub repetitions_max: u32,
    pub repetitions_base_delay_ms: u64,
    pub cyclic_offer_delay_ms: u64,
    pub request_response_delay_ms: u64,
    pub ttl: u32,
}

impl Default for SdSection {
    fn default() -> Self {
        let d = sd::SdConfig::default();
        SdSection {
            enable: true,
            multicast: d.multicast,
            port: d.port,
            initial_delay_min_ms: d.initial_delay_min.as_millis() as u64,
            initial_delay_max_ms: d.initial_delay_max.as_millis() as u64,
            repetitions_max: d.repetitions_max,
            repetitions_base_delay_ms: d.repetitions_base_delay.as_millis() as u64,
            cyclic_offer_delay_ms: d.cyclic_offer_delay.as_millis() as u64,
            request_response_delay_ms: d.request_response_delay.as_millis() as u64,
            ttl: d.ttl,
        }
    }
}

/// A specific queue cap for one (service, method).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSizeLimit {
    pub service: u16,
    pub method: u16,
    pub limit: usize,
}

/// The resolved runtime configuration.
///
/// Deserialized from JSON (see [`Config::load`]); unknown fields are
/// ignored so configurations written for richer deployments still parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address used in offered endpoint options.
    #[serde(rename = "unicast")]
    pub unicast: Ipv4Addr,
    /// Application that hosts the routing manager.
    pub routing: String,
    pub applications: Vec<ApplicationConfig>,
    pub services: Vec<ServiceConfig>,
    #[serde(rename = "service-discovery")]
    pub service_discovery: SdSection,

    pub max_message_size_reliable: usize,
    pub max_message_size_unreliable: usize,
    pub max_tp_size: usize,
    pub tp_enabled: bool,
    pub udp_mtu: usize,

    /// General per-endpoint queue cap in bytes (0 = unbounded).
    pub queue_size_limit_endpoints: usize,
    /// Specific caps; a matching entry overrides the general cap.
    pub queue_size_limits: Vec<QueueSizeLimit>,
    pub buffer_shrink_threshold: u32,

    pub check_credentials: bool,
    pub audit_mode: bool,

    pub routing_state_initial: crate::RoutingState,

    /// Base path of the routing manager's IPC socket.
    pub ipc_base_path: PathBuf,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,

    pub dispatch_workers: usize,
    pub dispatch_queue_watermark: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            unicast: default_unicast(),
            routing: default_routing_name(),
            applications: vec![],
            services: vec![],
            service_discovery: SdSection::default(),
            max_message_size_reliable: endpoint::DEFAULT_MAX_MESSAGE_SIZE_RELIABLE,
            max_message_size_unreliable: endpoint::DEFAULT_MAX_MESSAGE_SIZE_UNRELIABLE,
            max_tp_size: endpoint::DEFAULT_MAX_TP_SIZE,
            tp_enabled: false,
            udp_mtu: endpoint::DEFAULT_UDP_MTU,
            queue_size_limit_endpoints: 0,
            queue_size_limits: vec![],
            buffer_shrink_threshold: 5,
            check_credentials: false,
            audit_mode: false,
            routing_state_initial: crate::RoutingState::Running,
            ipc_base_path: default_ipc_base(),
            ping_interval_ms: 5_000,
            pong_timeout_ms: 3_000,
            dispatch_workers: 2,
            dispatch_queue_watermark: 64,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Path of the routing manager's listening socket.
    pub fn routing_socket(&self) -> PathBuf {
        self.ipc_base_path.with_extension("sock")
    }

    pub fn requested_client_id(&self, name: &str) -> Option<u16> {
        self.applications
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.id)
    }

    pub fn service(&self, service: u16, instance: u16) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service == service && s.instance == instance)
    }

    pub fn queue_limits(&self) -> endpoint::QueueLimits {
        let mut limits = endpoint::QueueLimits::bounded(self.queue_size_limit_endpoints);
        for q in &self.queue_size_limits {
            limits.specific.insert((q.service, q.method), q.limit);
        }
        limits
    }

    pub fn sd_config(&self) -> sd::SdConfig {
        let s = &self.service_discovery;
        sd::SdConfig {
            multicast: s.multicast,
            port: s.port,
            unicast: self.unicast,
            initial_delay_min: Duration::from_millis(s.initial_delay_min_ms),
            initial_delay_max: Duration::from_millis(s.initial_delay_max_ms),
            repetitions_max: s.repetitions_max,
            repetitions_base_delay: Duration::from_millis(s.repetitions_base_delay_ms),
            cyclic_offer_delay: Duration::from_millis(s.cyclic_offer_delay_ms),
            request_response_delay: Duration::from_millis(s.request_response_delay_ms),
            ttl: s.ttl,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.routing, "routingmanagerd");
        assert!(config.service_discovery.enable);
        assert_eq!(config.service_discovery.port, 30490);
        assert!(!config.check_credentials);
    }

    #[test]
    fn test_parse_json() {
        let raw = r#"{
            "unicast": "192.168.0.7",
            "routing": "someipd",
            "applications": [
                { "name": "brake-ctrl", "id": 4353 }
            ],
            "services": [
                {
                    "service": 4660,
                    "instance": 22136,
                    "reliable_port": 30509,
                    "unreliable_port": 30509,
                    "magic_cookies": true
                }
            ],
            "service-discovery": {
                "enable": true,
                "multicast": "224.244.224.245",
                "port": 30490,
                "cyclic_offer_delay_ms": 1000
            },
            "check_credentials": true,
            "unknown_future_option": { "ignored": true }
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.routing, "someipd");
        assert_eq!(config.requested_client_id("brake-ctrl"), Some(4353));
        let svc = config.service(4660, 22136).unwrap();
        assert_eq!(svc.reliable_port, Some(30509));
        assert!(svc.magic_cookies);
        assert_eq!(
            config.service_discovery.multicast,
            Ipv4Addr::new(224, 244, 224, 245)
        );
        assert_eq!(config.sd_config().cyclic_offer_delay, Duration::from_secs(1));
        assert!(config.check_credentials);
    }

    #[test]
    fn test_queue_limits_mapping() {
        let mut config = Config::default();
        config.queue_size_limit_endpoints = 1024;
        config.queue_size_limits.push(QueueSizeLimit {
            service: 0x1234,
            method: 0x0421,
            limit: 4096,
        });

        let limits = config.queue_limits();
        assert_eq!(limits.max_bytes, 1024);
        assert_eq!(limits.specific.get(&(0x1234, 0x0421)), Some(&4096));
    }
}
