use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use endpoint::{
    EndpointEvent, EndpointId, TcpClient, TcpClientConfig, TcpServer, TcpServerConfig, UdpClient,
    UdpClientConfig, UdpServer, UdpServerConfig,
};
use message::sd::is_sd_message;
use message::types::*;
use message::{Message, MessageType, ReturnCode};
use sd::{Reliability, SdAction, SdDestination, SdEngine};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::ipc::{encode_frame, Command, IpcFrame};
use crate::policy::{Credentials, PolicyManager};
use crate::registry::{
    EventKind, OfferOutcome, Provider, Registry, Subscriber, SubscriptionState,
};
use crate::routing::RoutingState;

const MAX_CODEC_ERRORS: u32 = 10;
const MAX_MISSED_PONGS: u32 = 3;

/// Everything that can happen to the routing task.
pub(crate) enum RoutingEvent {
    IpcOpened {
        conn: u64,
        writer: mpsc::Sender<Bytes>,
        creds: Credentials,
    },
    IpcFrame {
        conn: u64,
        frame: IpcFrame,
    },
    IpcClosed {
        conn: u64,
    },
    Endpoint(EndpointEvent),
    SetState {
        state: RoutingState,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Conn {
    writer: mpsc::Sender<Bytes>,
    creds: Credentials,
    client: Option<ClientId>,
    name: String,
    missed_pongs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpKind {
    Sd,
    EventReceiver,
    UdpServer { port: u16 },
    TcpServer { port: u16 },
    UdpClient { remote: SocketAddr },
    TcpClient { remote: SocketAddr },
}

/// Where a response to an inbound remote request has to go.
#[derive(Debug, Clone, Copy)]
struct ReplyPath {
    port: u16,
    reliable: bool,
    peer: SocketAddr,
}

/// An in-flight request towards a remote provider.
#[derive(Debug, Clone)]
struct Outstanding {
    service: ServiceId,
    instance: InstanceId,
    method: MethodId,
    client: ClientId,
    session: SessionId,
    interface_version: u8,
}

struct CyclicEvent {
    service: ServiceId,
    instance: InstanceId,
    event: EventId,
    period: Duration,
    due: Instant,
}

pub(crate) async fn run(
    config: Arc<Config>,
    mut events_rx: mpsc::Receiver<RoutingEvent>,
    events_tx: mpsc::Sender<RoutingEvent>,
) {
    let mut inner = match Inner::new(config, events_tx).await {
        Ok(inner) => inner,
        Err(e) => {
            log::error!("routing manager failed to start: {e}");
            return;
        }
    };

    let mut ping = tokio::time::interval(Duration::from_millis(
        inner.config.ping_interval_ms.max(100),
    ));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let sd_deadline = inner.next_deadline();

        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    RoutingEvent::IpcOpened { conn, writer, creds } => {
                        inner.conns.insert(conn, Conn {
                            writer,
                            creds,
                            client: None,
                            name: String::new(),
                            missed_pongs: 0,
                        });
                    }
                    RoutingEvent::IpcFrame { conn, frame } => {
                        inner.on_ipc_frame(conn, frame).await;
                    }
                    RoutingEvent::IpcClosed { conn } => {
                        inner.on_ipc_closed(conn).await;
                    }
                    RoutingEvent::Endpoint(event) => {
                        inner.on_endpoint_event(event).await;
                    }
                    RoutingEvent::SetState { state } => {
                        inner.set_routing_state(state).await;
                    }
                    RoutingEvent::Shutdown { done } => {
                        inner.set_routing_state(RoutingState::Shutdown).await;
                        let _ = done.send(());
                        break;
                    }
                }
            }

            _ = sleep_until_opt(sd_deadline), if sd_deadline.is_some() => {
                inner.on_timer(Instant::now()).await;
            }

            _ = ping.tick() => {
                inner.on_ping_tick().await;
            }
        }
    }

    log::info!("routing manager stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

struct Inner {
    config: Arc<Config>,
    state: RoutingState,
    registry: Registry,
    policy: PolicyManager,
    engine: Option<SdEngine>,

    conns: HashMap<u64, Conn>,
    clients: HashMap<ClientId, u64>,
    next_client: ClientId,
    /// (service, method) pairs each local provider registered handlers for.
    methods: HashMap<ClientId, HashSet<(ServiceId, MethodId)>>,

    endpoint_events: mpsc::Sender<EndpointEvent>,
    kinds: HashMap<EndpointId, EpKind>,
    next_endpoint: EndpointId,
    sd_endpoint: Option<UdpServer>,
    event_receiver: Option<UdpServer>,
    /// Joined eventgroup multicast groups, keyed by group address.
    multicast_receivers: HashMap<SocketAddr, UdpServer>,
    udp_servers: HashMap<u16, UdpServer>,
    tcp_servers: HashMap<u16, TcpServer>,
    udp_clients: HashMap<SocketAddr, UdpClient>,
    tcp_clients: HashMap<SocketAddr, TcpClient>,

    /// (port, service) → instance served on that port.
    serving: HashMap<(u16, ServiceId), InstanceId>,
    reply_paths: HashMap<(ClientId, SessionId, u32), ReplyPath>,
    outstanding: HashMap<EndpointId, Vec<Outstanding>>,
    codec_errors: HashMap<EndpointId, u32>,
    /// Session fill-in counters per (client, method).
    sessions: HashMap<(ClientId, MethodId), SessionId>,

    /// pending_id → sd decision token for remote subscriptions.
    pending_remote_subs: HashMap<u32, u64>,
    /// pending_id → (subscriber client, ttl) for local subscriptions.
    pending_local_subs: HashMap<u32, (ClientId, Ttl)>,
    next_pending: u32,

    cyclic: Vec<CyclicEvent>,
}

impl Inner {
    async fn new(
        config: Arc<Config>,
        routing_events: mpsc::Sender<RoutingEvent>,
    ) -> crate::Result<Inner> {
        // endpoint events are forwarded into the routing channel
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel::<EndpointEvent>(256);
        let forward = routing_events.clone();
        tokio::spawn(async move {
            while let Some(event) = endpoint_rx.recv().await {
                if forward.send(RoutingEvent::Endpoint(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut inner = Inner {
            state: config.routing_state_initial,
            policy: PolicyManager::new(config.check_credentials, config.audit_mode),
            registry: Registry::new(),
            engine: None,
            conns: HashMap::new(),
            clients: HashMap::new(),
            next_client: 0x0001,
            methods: HashMap::new(),
            endpoint_events: endpoint_tx,
            kinds: HashMap::new(),
            next_endpoint: 1,
            sd_endpoint: None,
            event_receiver: None,
            multicast_receivers: HashMap::new(),
            udp_servers: HashMap::new(),
            tcp_servers: HashMap::new(),
            udp_clients: HashMap::new(),
            tcp_clients: HashMap::new(),
            serving: HashMap::new(),
            reply_paths: HashMap::new(),
            outstanding: HashMap::new(),
            codec_errors: HashMap::new(),
            sessions: HashMap::new(),
            pending_remote_subs: HashMap::new(),
            pending_local_subs: HashMap::new(),
            next_pending: 1,
            cyclic: vec![],
            config,
        };

        if inner.config.service_discovery.enable {
            let sd_config = inner.config.sd_config();
            let id = inner.allocate_endpoint(EpKind::Sd);
            let server = UdpServer::start(
                id,
                UdpServerConfig {
                    local: SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), sd_config.port),
                    multicast: Some(sd_config.multicast),
                    max_message_size: inner.config.max_message_size_unreliable,
                    udp_mtu: inner.config.udp_mtu,
                    tp_enabled: false,
                    max_tp_size: inner.config.max_tp_size,
                    queue_limits: inner.config.queue_limits(),
                },
                inner.endpoint_events.clone(),
            )
            .await?;
            inner.sd_endpoint = Some(server);
            inner.engine = Some(SdEngine::new(sd_config));
        }

        // statically configured remote instances (discovery-less setups)
        let static_remotes: Vec<_> = inner
            .config
            .services
            .iter()
            .filter_map(|s| s.unicast.map(|ip| (s.clone(), ip)))
            .collect();
        for (svc, ip) in static_remotes {
            let provider = Provider::Remote {
                reliable: svc
                    .reliable_port
                    .map(|p| SocketAddr::new(IpAddr::V4(ip), p)),
                unreliable: svc
                    .unreliable_port
                    .map(|p| SocketAddr::new(IpAddr::V4(ip), p)),
            };
            let _ = inner.registry.offer(
                svc.service,
                svc.instance,
                DEFAULT_MAJOR,
                DEFAULT_MINOR,
                provider,
            );
            log::debug!(
                "static remote service {:04x}.{:04x} at {ip}",
                svc.service,
                svc.instance
            );
        }

        if inner.state != RoutingState::Running {
            let state = inner.state;
            inner.state = RoutingState::Running;
            inner.set_routing_state(state).await;
        }

        Ok(inner)
    }

    fn allocate_endpoint(&mut self, kind: EpKind) -> EndpointId {
        let id = self.next_endpoint;
        self.next_endpoint += 1;
        self.kinds.insert(id, kind);
        id
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next = self.engine.as_ref().and_then(|e| e.next_timeout());
        for cyclic in &self.cyclic {
            next = Some(match next {
                Some(n) => n.min(cyclic.due),
                None => cyclic.due,
            });
        }
        next
    }

    // === IPC plumbing =====================================================

    async fn send_to_conn(&self, conn: u64, client: ClientId, command: &Command) {
        if let Some(c) = self.conns.get(&conn) {
            let _ = c.writer.send(encode_frame(client, command)).await;
        }
    }

    async fn send_to_client(&self, client: ClientId, command: &Command) {
        if let Some(conn) = self.clients.get(&client) {
            self.send_to_conn(*conn, client, command).await;
        }
    }

    async fn on_ipc_frame(&mut self, conn: u64, frame: IpcFrame) {
        if !self.conns.contains_key(&conn) {
            return;
        }
        let sender = self.conns.get(&conn).and_then(|c| c.client);

        match frame.command {
            Command::RegisterApplication {
                name,
                requested_client,
            } => self.on_register_application(conn, name, requested_client).await,
            Command::DeregisterApplication => self.on_ipc_closed(conn).await,
            Command::Pong => {
                if let Some(c) = self.conns.get_mut(&conn) {
                    c.missed_pongs = 0;
                }
            }
            command => {
                // everything else requires a completed registration
                let Some(client) = sender else {
                    log::warn!("command {:#04x} before registration", command.code());
                    return;
                };
                self.on_client_command(conn, client, command).await;
            }
        }
    }

    async fn on_register_application(&mut self, conn: u64, name: String, requested: ClientId) {
        let assigned = self.assign_client_id(&name, requested);

        let peers: Vec<(ClientId, String)> = self
            .conns
            .values()
            .filter_map(|c| c.client.map(|id| (id, c.name.clone())))
            .collect();

        if let Some(c) = self.conns.get_mut(&conn) {
            c.client = Some(assigned);
            c.name = name;
        }
        self.clients.insert(assigned, conn);

        log::info!("application '{}' registered as {:#06x}",
            self.conns.get(&conn).map(|c| c.name.as_str()).unwrap_or(""),
            assigned);

        self.send_to_conn(
            conn,
            assigned,
            &Command::ApplicationInfo {
                assigned_client: assigned,
                peers,
            },
        )
        .await;
    }

    fn assign_client_id(&mut self, name: &str, requested: ClientId) -> ClientId {
        let configured = self.config.requested_client_id(name);
        for candidate in [configured.unwrap_or(0), requested] {
            if candidate != ILLEGAL_CLIENT && !self.clients.contains_key(&candidate) {
                return candidate;
            }
        }
        loop {
            let candidate = self.next_client;
            self.next_client = self.next_client.wrapping_add(1);
            if candidate != ILLEGAL_CLIENT && !self.clients.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    async fn on_ipc_closed(&mut self, conn: u64) {
        let Some(removed) = self.conns.remove(&conn) else {
            return;
        };
        let Some(client) = removed.client else {
            return;
        };
        self.clients.remove(&client);
        self.methods.remove(&client);
        log::info!("application {client:#06x} lost");

        // withdraw its offers, with availability edges and SD StopOffers
        let withdrawn = self.registry.remove_client(client);
        for (service, instance, interested) in withdrawn {
            self.serving.retain(|(_, s), i| !(*s == service && *i == instance));
            for observer in interested {
                self.send_to_client(observer, &Command::StopService { service, instance })
                    .await;
            }
            let actions = self
                .engine
                .as_mut()
                .map(|e| e.stop_offer_service(service, instance))
                .unwrap_or_default();
            self.process_sd_actions(actions).await;
        }

        // peers learn about the loss
        for (other, other_conn) in self.clients.clone() {
            self.send_to_conn(other_conn, other, &Command::ApplicationLost { client })
                .await;
        }
    }

    async fn on_ping_tick(&mut self) {
        let mut lost = vec![];
        for (conn, c) in self.conns.iter_mut() {
            if c.client.is_none() {
                continue;
            }
            c.missed_pongs += 1;
            if c.missed_pongs > MAX_MISSED_PONGS {
                lost.push(*conn);
            }
        }
        for conn in lost {
            log::warn!("application on connection {conn} missed {MAX_MISSED_PONGS} pongs");
            self.on_ipc_closed(conn).await;
        }

        let conns: Vec<(u64, ClientId)> = self
            .conns
            .iter()
            .filter_map(|(conn, c)| c.client.map(|id| (*conn, id)))
            .collect();
        for (conn, client) in conns {
            self.send_to_conn(conn, client, &Command::Ping).await;
        }
    }

    // === command handling =================================================

    async fn on_client_command(&mut self, conn: u64, client: ClientId, command: Command) {
        let creds = self
            .conns
            .get(&conn)
            .map(|c| c.creds)
            .unwrap_or_default();

        match command {
            Command::ProvideService {
                service,
                instance,
                major,
                minor,
                reliable_port,
                unreliable_port,
            } => {
                if !self.policy.is_offer_allowed(creds, service, instance) {
                    return;
                }
                self.on_provide_service(
                    client,
                    service,
                    instance,
                    major,
                    minor,
                    (reliable_port != 0).then_some(reliable_port),
                    (unreliable_port != 0).then_some(unreliable_port),
                )
                .await;
            }
            Command::WithdrawService { service, instance } => {
                self.on_withdraw_service(client, service, instance).await;
            }
            Command::RequestService {
                service,
                instance,
                major,
                minor,
            } => {
                if !self.policy.is_request_allowed_service(creds, service, instance) {
                    return;
                }
                self.on_request_service(client, service, instance, major, minor)
                    .await;
            }
            Command::ReleaseService { service, instance } => {
                self.registry.release(service, instance, client);
                if let Some(engine) = self.engine.as_mut() {
                    engine.release_service(service, instance);
                }
            }
            Command::ProvideEventgroup {
                service,
                instance,
                eventgroup,
                reliability,
                multicast_addr,
                multicast_port,
            } => {
                let reliability = reliability_from_u8(reliability);
                let multicast = (multicast_addr != 0).then(|| {
                    SocketAddr::new(
                        IpAddr::V4(std::net::Ipv4Addr::from(multicast_addr)),
                        multicast_port,
                    )
                });
                self.registry
                    .add_eventgroup(service, instance, eventgroup, reliability, multicast);
                if let Some(engine) = self.engine.as_mut() {
                    engine.offer_eventgroup(service, instance, eventgroup, reliability, multicast);
                }
            }
            Command::WithdrawEventgroup {
                service,
                instance,
                eventgroup,
            } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.stop_offer_eventgroup(service, instance, eventgroup);
                }
            }
            Command::RequestEventgroup {
                service,
                instance,
                event,
                ..
            } => {
                self.registry.request_event(service, instance, event, client);
            }
            Command::ReleaseEventgroup {
                service,
                instance,
                event,
                ..
            } => {
                self.registry.release_event(service, instance, event, client);
            }
            Command::RegisterMethod { service, method } => {
                self.methods.entry(client).or_default().insert((service, method));
            }
            Command::DeregisterMethod { service, method } => {
                if let Some(set) = self.methods.get_mut(&client) {
                    set.remove(&(service, method));
                }
            }
            Command::AddField {
                service,
                instance,
                event,
                eventgroups,
                cycle_ms,
                change_resets_cycle,
                payload,
            } => {
                let cycle = (cycle_ms != 0).then(|| Duration::from_millis(u64::from(cycle_ms)));
                self.registry.add_event(
                    service,
                    instance,
                    event,
                    if payload.is_empty() && cycle.is_none() {
                        EventKind::Event
                    } else {
                        EventKind::Field
                    },
                    Reliability::Unreliable,
                    &eventgroups,
                    cycle,
                    change_resets_cycle,
                );
                if !payload.is_empty() {
                    self.registry.cache_payload(service, instance, event, &payload);
                }
                if let Some(period) = cycle {
                    self.cyclic.retain(|c| {
                        !(c.service == service && c.instance == instance && c.event == event)
                    });
                    self.cyclic.push(CyclicEvent {
                        service,
                        instance,
                        event,
                        period,
                        due: Instant::now() + period,
                    });
                }
            }
            Command::RemoveField {
                service,
                instance,
                event,
            } => {
                self.registry.remove_event(service, instance, event);
                self.cyclic.retain(|c| {
                    !(c.service == service && c.instance == instance && c.event == event)
                });
            }
            Command::Send { instance, data } => {
                self.on_local_send(conn, client, creds, instance, data).await;
            }
            Command::Notify {
                instance,
                force,
                data,
            } => {
                self.on_notify(client, instance, force, data, None).await;
            }
            Command::NotifyOne {
                instance,
                target,
                force,
                data,
            } => {
                self.on_notify(client, instance, force, data, Some(target)).await;
            }
            Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                ttl,
                ..
            } => {
                self.on_local_subscribe(client, service, instance, eventgroup, major, ttl)
                    .await;
            }
            Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                ..
            } => {
                self.on_local_unsubscribe(client, service, instance, eventgroup)
                    .await;
            }
            Command::SubscribeAck {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            } => {
                self.on_subscription_verdict(service, instance, eventgroup, subscriber, pending_id, true)
                    .await;
            }
            Command::SubscribeNack {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            } => {
                self.on_subscription_verdict(service, instance, eventgroup, subscriber, pending_id, false)
                    .await;
            }
            Command::OfferedServicesRequest { offer_type } => {
                let filter = match offer_type {
                    0x00 => Some(true),
                    0x01 => Some(false),
                    _ => None,
                };
                let services = self.registry.offered_services(filter);
                self.send_to_client(client, &Command::OfferedServicesResponse { services })
                    .await;
            }
            Command::UpdateSecurityPolicy { uid, gid, rights } => {
                if self.is_routing_host(conn) {
                    self.policy.update(Credentials { uid, gid }, rights);
                }
            }
            Command::RemoveSecurityPolicy { uid, gid } => {
                if self.is_routing_host(conn) {
                    self.policy.remove(Credentials { uid, gid });
                }
            }
            Command::RoutingState { state } => {
                if self.is_routing_host(conn) {
                    self.set_routing_state(state).await;
                }
            }
            other => {
                log::debug!("unexpected command {:#04x} from {client:#06x}", other.code());
            }
        }
    }

    fn is_routing_host(&self, conn: u64) -> bool {
        self.conns
            .get(&conn)
            .map(|c| c.name == self.config.routing)
            .unwrap_or(false)
    }

    async fn on_provide_service(
        &mut self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        reliable_port: Option<u16>,
        unreliable_port: Option<u16>,
    ) {
        match self
            .registry
            .offer(service, instance, major, minor, Provider::Local { client })
        {
            OfferOutcome::Conflict => {
                log::warn!(
                    "offer conflict: {service:04x}.{instance:04x} already has a provider"
                );
                return;
            }
            OfferOutcome::Unchanged => return,
            OfferOutcome::Offered { interested } => {
                for observer in interested {
                    self.send_to_client(observer, &Command::StartService { service, instance })
                        .await;
                }
            }
        }

        if let Some(port) = reliable_port {
            if self.ensure_tcp_server(port).await {
                self.serving.insert((port, service), instance);
            }
        }
        if let Some(port) = unreliable_port {
            if self.ensure_udp_server(port).await {
                self.serving.insert((port, service), instance);
            }
        }

        if let Some(engine) = self.engine.as_mut() {
            engine.offer_service(
                service,
                instance,
                major,
                minor,
                reliable_port,
                unreliable_port,
                Instant::now(),
            );
        }
    }

    async fn on_withdraw_service(
        &mut self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
    ) {
        let Some(interested) = self
            .registry
            .stop_offer(service, instance, true, Some(client))
        else {
            return;
        };
        self.serving.retain(|(_, s), i| !(*s == service && *i == instance));
        for observer in interested {
            self.send_to_client(observer, &Command::StopService { service, instance })
                .await;
        }
        let actions = self
            .engine
            .as_mut()
            .map(|e| e.stop_offer_service(service, instance))
            .unwrap_or_default();
        self.process_sd_actions(actions).await;
    }

    async fn on_request_service(
        &mut self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let available = self.registry.request(service, instance, major, minor, client);
        self.send_to_client(client, &Command::RequestServiceAck { service, instance })
            .await;

        if available {
            self.send_to_client(client, &Command::StartService { service, instance })
                .await;
        } else if let Some(engine) = self.engine.as_mut() {
            engine.request_service(service, instance, major, minor, Instant::now());
        }
    }

    // === local message routing ============================================

    async fn on_local_send(
        &mut self,
        conn: u64,
        client: ClientId,
        creds: Credentials,
        instance: InstanceId,
        data: Bytes,
    ) {
        let mut msg = match Message::unmarshal(&data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("malformed frame from {client:#06x}: {e}");
                self.on_ipc_closed(conn).await;
                return;
            }
        };

        if msg.header.message_type.is_request() {
            if msg.header.client == ILLEGAL_CLIENT {
                msg.header.client = client;
            }
            if msg.header.session == 0 {
                msg.header.session = self.next_session(msg.header.client, msg.header.method);
            }
            if !self.policy.is_request_allowed(
                creds,
                msg.header.service,
                instance,
                msg.header.method,
            ) {
                return;
            }
        }

        if msg.header.message_type.is_response() {
            self.route_response(msg).await;
        } else {
            self.route_request(client, instance, msg).await;
        }
    }

    fn next_session(&mut self, client: ClientId, method: MethodId) -> SessionId {
        let counter = self.sessions.entry((client, method)).or_insert(0);
        *counter = if *counter == 0xFFFF { 1 } else { *counter + 1 };
        *counter
    }

    async fn route_response(&mut self, msg: Message) {
        let key = (msg.header.client, msg.header.session, msg.header.message_id());
        if let Some(path) = self.reply_paths.remove(&key) {
            // response goes back on the transport the request came in on
            self.send_wire_response(path, &msg).await;
            return;
        }

        // local requester
        let target = msg.header.client;
        if self.clients.contains_key(&target) {
            let instance = self
                .serving
                .iter()
                .find(|((_, s), _)| *s == msg.header.service)
                .map(|(_, i)| *i)
                .unwrap_or(0);
            self.forward_frame_to_client(target, instance, &msg).await;
        } else {
            log::debug!("dropping response for unknown client {target:#06x}");
        }
    }

    async fn send_wire_response(&mut self, path: ReplyPath, msg: &Message) {
        let result = if path.reliable {
            self.tcp_servers
                .get(&path.port)
                .map(|s| s.send_to(path.peer, msg))
        } else {
            self.udp_servers
                .get(&path.port)
                .map(|s| s.send_to(path.peer, msg))
        };
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => log::warn!("failed to send response to {}: {e}", path.peer),
            None => log::warn!("response path endpoint on port {} is gone", path.port),
        }
    }

    async fn route_request(&mut self, sender: ClientId, instance: InstanceId, msg: Message) {
        let service = msg.header.service;
        let instance = if instance == ANY_INSTANCE {
            self.registry.any_instance(service).unwrap_or(instance)
        } else {
            instance
        };

        match self.registry.provider(service, instance).map(|si| si.provider) {
            Some(Provider::Local { client: provider }) => {
                if msg.header.message_type.is_request()
                    && !self.provider_implements(provider, service, msg.header.method)
                {
                    self.synthesize_error(&msg, ReturnCode::UnknownMethod).await;
                    return;
                }
                self.forward_frame_to_client(provider, instance, &msg).await;
            }
            Some(Provider::Remote {
                reliable,
                unreliable,
            }) => {
                self.send_to_remote(instance, reliable, unreliable, msg).await;
            }
            None => {
                log::debug!("no provider for {service:04x}.{instance:04x}");
                if msg.header.message_type.expects_response() {
                    self.synthesize_error(&msg, ReturnCode::UnknownService).await;
                }
                let _ = sender;
            }
        }
    }

    fn provider_implements(&self, provider: ClientId, service: ServiceId, method: MethodId) -> bool {
        match self.methods.get(&provider) {
            // providers that never registered methods accept everything
            None => true,
            Some(set) if set.is_empty() => true,
            Some(set) => set.contains(&(service, method)) || is_event_id(method),
        }
    }

    async fn forward_frame_to_client(&self, client: ClientId, instance: InstanceId, msg: &Message) {
        let data = match msg.marshal(usize::MAX) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to marshal local frame: {e}");
                return;
            }
        };
        self.send_to_client(client, &Command::Send { instance, data })
            .await;
    }

    /// Synthesizes an ERROR back to the local originator of `request`.
    async fn synthesize_error(&self, request: &Message, code: ReturnCode) {
        if !request.header.message_type.expects_response() {
            return;
        }
        let error = Message::error_to(request, code);
        let target = request.header.client;
        self.forward_frame_to_client(target, 0, &error).await;
    }

    async fn send_to_remote(
        &mut self,
        instance: InstanceId,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        msg: Message,
    ) {
        let record = |inner: &mut Inner, id: EndpointId, msg: &Message| {
            if msg.header.message_type.expects_response() {
                inner.outstanding.entry(id).or_default().push(Outstanding {
                    service: msg.header.service,
                    instance,
                    method: msg.header.method,
                    client: msg.header.client,
                    session: msg.header.session,
                    interface_version: msg.header.interface_version,
                });
            }
        };

        // reliable leg preferred when the provider exposes both
        if let Some(remote) = reliable {
            let id = self.ensure_tcp_client(remote).await;
            record(self, id, &msg);
            let result = self.tcp_clients.get(&remote).map(|e| e.send(&msg));
            if let Some(Err(e)) = result {
                log::warn!("tcp send to {remote} failed: {e}");
                self.fail_outstanding(id).await;
            }
            return;
        }

        if let Some(remote) = unreliable {
            let id = match self.ensure_udp_client(remote).await {
                Some(id) => id,
                None => return,
            };
            record(self, id, &msg);
            let result = self.udp_clients.get(&remote).map(|e| e.send(&msg));
            if let Some(Err(e)) = result {
                log::warn!("udp send to {remote} failed: {e}");
                self.fail_outstanding(id).await;
            }
            return;
        }

        log::warn!("remote provider without usable endpoint");
        self.synthesize_error(&msg, ReturnCode::NotReachable).await;
    }

    /// Endpoint died with requests in flight: E_NOT_REACHABLE to callers.
    async fn fail_outstanding(&mut self, endpoint: EndpointId) {
        let Some(pending) = self.outstanding.remove(&endpoint) else {
            return;
        };
        for o in pending {
            let error = Message {
                header: message::Header {
                    service: o.service,
                    method: o.method,
                    client: o.client,
                    session: o.session,
                    protocol_version: message::PROTOCOL_VERSION,
                    interface_version: o.interface_version,
                    message_type: MessageType::Error,
                    return_code: ReturnCode::NotReachable,
                    ..Default::default()
                },
                payload: Bytes::new(),
            };
            self.forward_frame_to_client(o.client, o.instance, &error).await;
        }
    }

    // === notifications ====================================================

    async fn on_notify(
        &mut self,
        sender: ClientId,
        instance: InstanceId,
        force: bool,
        data: Bytes,
        only: Option<ClientId>,
    ) {
        let msg = match Message::unmarshal(&data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("malformed notification from {sender:#06x}: {e}");
                return;
            }
        };
        let service = msg.header.service;
        let event = msg.header.method;

        let changed = self.registry.cache_payload(service, instance, event, &msg.payload);
        let (is_field, resets_cycle) = self
            .registry
            .event(service, instance, event)
            .map(|e| (e.kind == EventKind::Field, e.change_resets_cycle))
            .unwrap_or((false, false));
        if is_field && !changed && !force {
            log::trace!("suppressing unchanged field {event:04x}");
            return;
        }
        if changed && resets_cycle {
            for c in self.cyclic.iter_mut() {
                if c.service == service && c.instance == instance && c.event == event {
                    c.due = Instant::now() + c.period;
                }
            }
        }

        // local subscribers
        let targets = match only {
            Some(target) => {
                let eligible = self
                    .registry
                    .local_event_targets(service, instance, event)
                    .contains(&target);
                if eligible { vec![target] } else { vec![] }
            }
            None => self.registry.local_event_targets(service, instance, event),
        };
        for target in targets {
            self.forward_frame_to_client(target, instance, &msg).await;
        }

        // remote subscribers, deduplicated per multicast group
        if only.is_none() {
            let remote = self.registry.remote_event_targets(service, instance, event);
            let multicast = self
                .registry
                .event(service, instance, event)
                .and_then(|e| e.eventgroups.iter().next().copied())
                .and_then(|eg| self.registry.eventgroup(service, instance, eg))
                .and_then(|g| g.multicast);
            let port = self.unreliable_port_of(service, instance);

            if let (Some(group), Some(port)) = (multicast, port) {
                if !remote.is_empty() {
                    if let Some(server) = self.udp_servers.get(&port) {
                        if let Err(e) = server.send_to(group, &msg) {
                            log::warn!("multicast notify failed: {e}");
                        }
                    }
                }
            } else {
                for (_, _, sub_reliable, sub_unreliable) in remote {
                    self.send_notification_unicast(
                        service, instance, sub_reliable, sub_unreliable, &msg,
                    )
                    .await;
                }
            }
        }
    }

    async fn send_notification_unicast(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        sub_reliable: Option<SocketAddr>,
        sub_unreliable: Option<SocketAddr>,
        msg: &Message,
    ) {
        if let Some(target) = sub_unreliable {
            if let Some(port) = self.unreliable_port_of(service, instance) {
                if let Some(server) = self.udp_servers.get(&port) {
                    if let Err(e) = server.send_to(target, msg) {
                        log::warn!("notify to {target} failed: {e}");
                    }
                    return;
                }
            }
        }
        if let Some(target) = sub_reliable {
            if let Some(port) = self.reliable_port_of(service, instance) {
                if let Some(server) = self.tcp_servers.get(&port) {
                    if let Err(e) = server.send_to(target, msg) {
                        log::warn!("notify to {target} failed: {e}");
                    }
                }
            }
        }
    }

    fn unreliable_port_of(&self, service: ServiceId, instance: InstanceId) -> Option<u16> {
        self.serving
            .iter()
            .find(|((port, s), i)| {
                *s == service && **i == instance && self.udp_servers.contains_key(port)
            })
            .map(|((port, _), _)| *port)
    }

    fn reliable_port_of(&self, service: ServiceId, instance: InstanceId) -> Option<u16> {
        self.serving
            .iter()
            .find(|((port, s), i)| {
                *s == service && **i == instance && self.tcp_servers.contains_key(port)
            })
            .map(|((port, _), _)| *port)
    }

    // === subscriptions ====================================================

    async fn on_local_subscribe(
        &mut self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) {
        match self.registry.provider(service, instance).map(|si| si.provider) {
            Some(Provider::Local { client: provider }) => {
                let already_acked = self
                    .registry
                    .subscription_state(service, instance, eventgroup, Subscriber::Local(client))
                    == Some(SubscriptionState::Acked);

                self.registry.subscribe(
                    service,
                    instance,
                    eventgroup,
                    Subscriber::Local(client),
                    ttl,
                    SubscriptionState::Pending,
                    None,
                    None,
                );

                if already_acked {
                    // refresh: no provider round trip, no new edge
                    self.registry.set_subscription_state(
                        service,
                        instance,
                        eventgroup,
                        Subscriber::Local(client),
                        SubscriptionState::Acked,
                    );
                    return;
                }

                let pending_id = self.next_pending;
                self.next_pending += 1;
                self.pending_local_subs.insert(pending_id, (client, ttl));
                self.send_to_client(
                    provider,
                    &Command::Subscribe {
                        service,
                        instance,
                        eventgroup,
                        major,
                        ttl,
                        subscriber: client,
                        pending_id,
                    },
                )
                .await;
            }
            Some(Provider::Remote { .. }) | None => {
                self.registry.subscribe(
                    service,
                    instance,
                    eventgroup,
                    Subscriber::Local(client),
                    ttl,
                    SubscriptionState::Pending,
                    None,
                    None,
                );
                let unreliable_local = self.ensure_event_receiver().await;
                let actions = self
                    .engine
                    .as_mut()
                    .map(|e| {
                        e.subscribe(service, instance, eventgroup, major, ttl, None, unreliable_local)
                    })
                    .unwrap_or_default();
                self.process_sd_actions(actions).await;
            }
        }
    }

    async fn on_local_unsubscribe(
        &mut self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.registry
            .unsubscribe(service, instance, eventgroup, Subscriber::Local(client));

        match self.registry.provider(service, instance).map(|si| si.provider) {
            Some(Provider::Local { client: provider }) => {
                self.send_to_client(
                    provider,
                    &Command::Unsubscribe {
                        service,
                        instance,
                        eventgroup,
                        subscriber: client,
                    },
                )
                .await;
            }
            _ => {
                // last local subscriber gone: withdraw on the wire
                let none_left = self
                    .registry
                    .subscription_state(service, instance, eventgroup, Subscriber::Local(client))
                    .is_none();
                if none_left {
                    let actions = self
                        .engine
                        .as_mut()
                        .map(|e| e.unsubscribe(service, instance, eventgroup))
                        .unwrap_or_default();
                    self.process_sd_actions(actions).await;
                }
            }
        }
    }

    /// Provider verdict for a pending subscription (local or remote).
    async fn on_subscription_verdict(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
        pending_id: u32,
        accept: bool,
    ) {
        if let Some(token) = self.pending_remote_subs.remove(&pending_id) {
            let actions = match self.engine.as_mut() {
                Some(engine) => match engine.resolve_subscription(token, accept, Instant::now()) {
                    Ok(actions) => actions,
                    Err(e) => {
                        log::warn!("stale subscription verdict: {e}");
                        return;
                    }
                },
                None => vec![],
            };
            self.process_sd_actions(actions).await;
            return;
        }

        if let Some((client, ttl)) = self.pending_local_subs.remove(&pending_id) {
            let state = if accept {
                SubscriptionState::Acked
            } else {
                SubscriptionState::Nacked
            };
            self.registry.set_subscription_state(
                service,
                instance,
                eventgroup,
                Subscriber::Local(client),
                state,
            );
            let _ = ttl;

            let reply = if accept {
                Command::SubscribeAck {
                    service,
                    instance,
                    eventgroup,
                    subscriber: client,
                    pending_id: 0,
                }
            } else {
                Command::SubscribeNack {
                    service,
                    instance,
                    eventgroup,
                    subscriber: client,
                    pending_id: 0,
                }
            };
            self.send_to_client(client, &reply).await;

            if accept {
                self.deliver_cached_fields_local(service, instance, eventgroup, client)
                    .await;
            }
            return;
        }

        let _ = subscriber;
        log::debug!("verdict for unknown pending subscription {pending_id}");
    }

    /// New subscriber of a field eventgroup gets the cached values.
    async fn deliver_cached_fields_local(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    ) {
        let Some(group) = self.registry.eventgroup(service, instance, eventgroup) else {
            return;
        };
        let fields: Vec<(EventId, Bytes)> = group
            .events
            .iter()
            .filter_map(|event| {
                self.registry.event(service, instance, *event).and_then(|e| {
                    if e.kind == EventKind::Field && e.requested_by.contains(&client) {
                        e.cached.clone().map(|payload| (*event, payload))
                    } else {
                        None
                    }
                })
            })
            .collect();

        let major = self
            .registry
            .provider(service, instance)
            .map(|si| si.major)
            .unwrap_or(DEFAULT_MAJOR);
        for (event, payload) in fields {
            let msg = Message::notification(service, event, major, payload);
            self.forward_frame_to_client(client, instance, &msg).await;
        }
    }

    // === endpoints ========================================================

    async fn ensure_tcp_server(&mut self, port: u16) -> bool {
        if self.tcp_servers.contains_key(&port) {
            return true;
        }
        let id = self.allocate_endpoint(EpKind::TcpServer { port });
        let config = TcpServerConfig {
            local: SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port),
            max_message_size: self.config.max_message_size_reliable,
            cookies_enabled: self
                .config
                .services
                .iter()
                .any(|s| s.reliable_port == Some(port) && s.magic_cookies),
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
            buffer_shrink_threshold: self.config.buffer_shrink_threshold,
            ..Default::default()
        };
        match TcpServer::start(id, config, self.endpoint_events.clone()).await {
            Ok(server) => {
                self.tcp_servers.insert(port, server);
                true
            }
            Err(e) => {
                log::error!("failed to open tcp server on port {port}: {e}");
                self.kinds.remove(&id);
                false
            }
        }
    }

    async fn ensure_udp_server(&mut self, port: u16) -> bool {
        if self.udp_servers.contains_key(&port) {
            return true;
        }
        let id = self.allocate_endpoint(EpKind::UdpServer { port });
        let config = UdpServerConfig {
            local: SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port),
            multicast: None,
            max_message_size: self.config.max_message_size_unreliable,
            udp_mtu: self.config.udp_mtu,
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
        };
        match UdpServer::start(id, config, self.endpoint_events.clone()).await {
            Ok(server) => {
                self.udp_servers.insert(port, server);
                true
            }
            Err(e) => {
                log::error!("failed to open udp server on port {port}: {e}");
                self.kinds.remove(&id);
                false
            }
        }
    }

    /// Endpoint that receives unicast event notifications from remote
    /// providers; its address rides in our Subscribe entries.
    async fn ensure_event_receiver(&mut self) -> Option<SocketAddr> {
        if let Some(receiver) = &self.event_receiver {
            return Some(receiver.local_addr());
        }
        let id = self.allocate_endpoint(EpKind::EventReceiver);
        let config = UdpServerConfig {
            local: SocketAddr::new(IpAddr::V4(self.config.unicast), 0),
            multicast: None,
            max_message_size: self.config.max_message_size_unreliable,
            udp_mtu: self.config.udp_mtu,
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
        };
        match UdpServer::start(id, config, self.endpoint_events.clone()).await {
            Ok(server) => {
                let addr = server.local_addr();
                self.event_receiver = Some(server);
                Some(addr)
            }
            Err(e) => {
                log::error!("failed to open event receiver endpoint: {e}");
                self.kinds.remove(&id);
                None
            }
        }
    }

    /// The provider's Ack announced an eventgroup multicast address: join
    /// the group so its notifications reach us.
    async fn join_eventgroup_multicast(&mut self, group: SocketAddr) {
        if self.multicast_receivers.contains_key(&group) {
            return;
        }
        let IpAddr::V4(group_ip) = group.ip() else {
            log::warn!("ignoring non-ipv4 eventgroup multicast {group}");
            return;
        };

        let id = self.allocate_endpoint(EpKind::EventReceiver);
        let config = UdpServerConfig {
            local: SocketAddr::new(
                IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                group.port(),
            ),
            multicast: Some(group_ip),
            max_message_size: self.config.max_message_size_unreliable,
            udp_mtu: self.config.udp_mtu,
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
        };
        match UdpServer::start(id, config, self.endpoint_events.clone()).await {
            Ok(server) => {
                log::info!("joined eventgroup multicast {group}");
                self.multicast_receivers.insert(group, server);
            }
            Err(e) => {
                log::warn!("failed to join eventgroup multicast {group}: {e}");
                self.kinds.remove(&id);
            }
        }
    }

    async fn ensure_tcp_client(&mut self, remote: SocketAddr) -> EndpointId {
        if let Some(existing) = self.tcp_clients.get(&remote) {
            return existing.id();
        }
        let id = self.allocate_endpoint(EpKind::TcpClient { remote });
        let config = TcpClientConfig {
            remote,
            max_message_size: self.config.max_message_size_reliable,
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
            buffer_shrink_threshold: self.config.buffer_shrink_threshold,
            ..Default::default()
        };
        let client = TcpClient::start(id, config, self.endpoint_events.clone());
        self.tcp_clients.insert(remote, client);
        id
    }

    async fn ensure_udp_client(&mut self, remote: SocketAddr) -> Option<EndpointId> {
        if let Some(existing) = self.udp_clients.get(&remote) {
            return Some(existing.id());
        }
        let id = self.allocate_endpoint(EpKind::UdpClient { remote });
        let config = UdpClientConfig {
            local: "0.0.0.0:0".parse().unwrap(),
            remote,
            max_message_size: self.config.max_message_size_unreliable,
            udp_mtu: self.config.udp_mtu,
            tp_enabled: self.config.tp_enabled,
            max_tp_size: self.config.max_tp_size,
            queue_limits: self.config.queue_limits(),
        };
        match UdpClient::start(id, config, self.endpoint_events.clone()).await {
            Ok(client) => {
                self.udp_clients.insert(remote, client);
                Some(id)
            }
            Err(e) => {
                log::error!("failed to open udp client to {remote}: {e}");
                self.kinds.remove(&id);
                None
            }
        }
    }

    // === endpoint events ==================================================

    async fn on_endpoint_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Frame {
                endpoint,
                peer,
                message,
                ..
            } => {
                self.on_wire_frame(endpoint, peer, message).await;
            }
            EndpointEvent::Connected { .. } => {}
            EndpointEvent::Disconnected { endpoint, .. } => {
                self.fail_outstanding(endpoint).await;
            }
            EndpointEvent::CodecError { endpoint, peer, error } => {
                let count = self.codec_errors.entry(endpoint).or_insert(0);
                *count += 1;
                log::debug!(
                    "codec error #{count} on endpoint {endpoint} ({peer:?}): {error}"
                );
                if *count >= MAX_CODEC_ERRORS {
                    self.codec_errors.remove(&endpoint);
                    self.reset_endpoint(endpoint).await;
                }
            }
        }
    }

    /// Repeated codec failures: tear the endpoint down. Client endpoints
    /// are recreated on demand; server endpoints stay down until re-offer.
    async fn reset_endpoint(&mut self, endpoint: EndpointId) {
        let Some(kind) = self.kinds.remove(&endpoint) else {
            return;
        };
        log::warn!("resetting endpoint {endpoint} after repeated codec errors");
        match kind {
            EpKind::TcpClient { remote } => {
                if let Some(client) = self.tcp_clients.remove(&remote) {
                    client.close().await;
                }
            }
            EpKind::UdpClient { remote } => {
                if let Some(client) = self.udp_clients.remove(&remote) {
                    client.close().await;
                }
            }
            EpKind::TcpServer { port } => {
                if let Some(server) = self.tcp_servers.remove(&port) {
                    server.close();
                }
            }
            EpKind::UdpServer { port } => {
                if let Some(server) = self.udp_servers.remove(&port) {
                    server.close();
                }
            }
            EpKind::Sd | EpKind::EventReceiver => {
                // discovery and event intake stay up; losing them silently
                // would partition the node
                self.kinds.insert(endpoint, kind);
            }
        }
        self.fail_outstanding(endpoint).await;
    }

    async fn on_wire_frame(&mut self, endpoint: EndpointId, peer: SocketAddr, msg: Message) {
        let Some(kind) = self.kinds.get(&endpoint).copied() else {
            return;
        };

        if kind == EpKind::Sd {
            if is_sd_message(&msg) {
                self.on_sd_frame(peer, &msg).await;
            }
            return;
        }

        match msg.header.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                self.on_wire_request(kind, peer, msg).await;
            }
            MessageType::Response | MessageType::Error => {
                self.on_wire_response(endpoint, msg).await;
            }
            MessageType::Notification => {
                self.on_wire_notification(peer, msg).await;
            }
            other => {
                log::debug!("ignoring wire frame of type {other}");
            }
        }
    }

    async fn on_sd_frame(&mut self, peer: SocketAddr, msg: &Message) {
        // multicast loop delivers our own offers back to us
        if peer.ip() == IpAddr::V4(self.config.unicast) {
            return;
        }
        let sd_msg = match message::sd::SdMessage::from_message(msg) {
            Ok(sd_msg) => sd_msg,
            Err(e) => {
                log::debug!("malformed sd message from {peer}: {e}");
                return;
            }
        };
        if sd_msg.rejected_entries > 0 {
            log::debug!(
                "sd message from {peer} had {} rejected entries",
                sd_msg.rejected_entries
            );
        }
        let actions = match self.engine.as_mut() {
            Some(engine) => {
                engine.handle_message(&sd_msg, msg.header.session, peer, Instant::now())
            }
            None => vec![],
        };
        self.process_sd_actions(actions).await;
    }

    async fn on_wire_request(&mut self, kind: EpKind, peer: SocketAddr, msg: Message) {
        let (port, reliable) = match kind {
            EpKind::TcpServer { port } => (port, true),
            EpKind::UdpServer { port } => (port, false),
            _ => {
                log::debug!("request on non-server endpoint");
                return;
            }
        };

        let Some(instance) = self.serving.get(&(port, msg.header.service)).copied() else {
            log::debug!(
                "unknown service {:04x} on port {port}",
                msg.header.service
            );
            self.send_wire_error(port, reliable, peer, &msg, ReturnCode::UnknownService)
                .await;
            return;
        };

        let Some(Provider::Local { client: provider }) = self
            .registry
            .provider(msg.header.service, instance)
            .map(|si| si.provider)
        else {
            self.send_wire_error(port, reliable, peer, &msg, ReturnCode::UnknownService)
                .await;
            return;
        };

        if msg.header.message_type.expects_response()
            && !self.provider_implements(provider, msg.header.service, msg.header.method)
        {
            self.send_wire_error(port, reliable, peer, &msg, ReturnCode::UnknownMethod)
                .await;
            return;
        }

        if msg.header.message_type.expects_response() {
            self.reply_paths.insert(
                (msg.header.client, msg.header.session, msg.header.message_id()),
                ReplyPath {
                    port,
                    reliable,
                    peer,
                },
            );
        }

        self.forward_frame_to_client(provider, instance, &msg).await;
    }

    async fn send_wire_error(
        &mut self,
        port: u16,
        reliable: bool,
        peer: SocketAddr,
        request: &Message,
        code: ReturnCode,
    ) {
        if !request.header.message_type.expects_response() {
            return;
        }
        let error = Message::error_to(request, code);
        let path = ReplyPath {
            port,
            reliable,
            peer,
        };
        self.send_wire_response(path, &error).await;
    }

    async fn on_wire_response(&mut self, endpoint: EndpointId, msg: Message) {
        if let Some(pending) = self.outstanding.get_mut(&endpoint) {
            if let Some(pos) = pending.iter().position(|o| {
                o.client == msg.header.client
                    && o.session == msg.header.session
                    && o.service == msg.header.service
                    && o.method == msg.header.method
            }) {
                let o = pending.remove(pos);
                self.forward_frame_to_client(o.client, o.instance, &msg).await;
                return;
            }
        }

        // unsolicited response; correlate by client id only
        let target = msg.header.client;
        if self.clients.contains_key(&target) {
            self.forward_frame_to_client(target, 0, &msg).await;
        } else {
            log::debug!("dropping uncorrelated response {}", msg.header);
        }
    }

    async fn on_wire_notification(&mut self, peer: SocketAddr, msg: Message) {
        let service = msg.header.service;
        let event = msg.header.method;
        let Some(instance) = self.find_remote_instance(service, peer.ip()) else {
            log::debug!("notification for unknown remote instance of {service:04x}");
            return;
        };

        for target in self.registry.local_event_targets(service, instance, event) {
            self.forward_frame_to_client(target, instance, &msg).await;
        }
    }

    fn find_remote_instance(&self, service: ServiceId, ip: IpAddr) -> Option<InstanceId> {
        for (svc, inst) in self.registry.offered_services(Some(false)) {
            if svc != service {
                continue;
            }
            if let Some(si) = self.registry.provider(svc, inst) {
                if let Provider::Remote {
                    reliable,
                    unreliable,
                } = si.provider
                {
                    let matches = reliable.map(|a| a.ip() == ip).unwrap_or(false)
                        || unreliable.map(|a| a.ip() == ip).unwrap_or(false);
                    if matches {
                        return Some(inst);
                    }
                }
            }
        }
        // multicast notifications may come from an interface address not in
        // any endpoint option; accept when the service is unambiguous
        let mut candidates = self
            .registry
            .offered_services(Some(false))
            .into_iter()
            .filter(|(svc, _)| *svc == service);
        match (candidates.next(), candidates.next()) {
            (Some((_, inst)), None) => Some(inst),
            _ => None,
        }
    }

    // === SD glue ==========================================================

    async fn process_sd_actions(&mut self, actions: Vec<SdAction>) {
        for action in actions {
            match action {
                SdAction::Send { message, to } => {
                    let target = match to {
                        SdDestination::Multicast => {
                            let sd = &self.config.service_discovery;
                            SocketAddr::new(IpAddr::V4(sd.multicast), sd.port)
                        }
                        SdDestination::Unicast(addr) => addr,
                    };
                    if let Some(server) = &self.sd_endpoint {
                        if let Err(e) = server.send_to(target, &message) {
                            log::warn!("sd send to {target} failed: {e}");
                        }
                    }
                }
                SdAction::Decide(decision) => {
                    self.on_remote_subscription_request(decision).await;
                }
                SdAction::RemoteOffered(remote) => {
                    self.on_remote_offered(remote).await;
                }
                SdAction::RemoteExpired { service, instance } => {
                    self.on_remote_expired(service, instance).await;
                }
                SdAction::SubscriptionAcked {
                    service,
                    instance,
                    eventgroup,
                    multicast,
                } => {
                    if let Some(group) = multicast {
                        self.join_eventgroup_multicast(group).await;
                    }
                    self.on_own_subscription_settled(service, instance, eventgroup, true)
                        .await;
                }
                SdAction::SubscriptionNacked {
                    service,
                    instance,
                    eventgroup,
                } => {
                    self.on_own_subscription_settled(service, instance, eventgroup, false)
                        .await;
                }
                SdAction::RemoteSubscribed {
                    service,
                    instance,
                    eventgroup,
                    subscriber,
                    reliable,
                    unreliable,
                    ttl,
                } => {
                    self.registry.subscribe(
                        service,
                        instance,
                        eventgroup,
                        Subscriber::Remote(subscriber),
                        ttl,
                        SubscriptionState::Acked,
                        reliable,
                        unreliable,
                    );
                    self.deliver_cached_fields_remote(service, instance, eventgroup)
                        .await;
                }
                SdAction::RemoteUnsubscribed {
                    service,
                    instance,
                    eventgroup,
                    subscriber,
                } => {
                    self.registry.unsubscribe(
                        service,
                        instance,
                        eventgroup,
                        Subscriber::Remote(subscriber),
                    );
                    self.notify_provider_unsubscribed(service, instance, eventgroup)
                        .await;
                }
                SdAction::PeerRebooted { peer } => {
                    self.on_peer_rebooted(peer).await;
                }
            }
        }
    }

    async fn on_remote_subscription_request(&mut self, decision: sd::SubscriptionDecision) {
        let provider = self
            .registry
            .provider(decision.service, decision.instance)
            .map(|si| si.provider);

        let Some(Provider::Local { client: provider }) = provider else {
            // provider vanished between Offer and Subscribe
            let actions = self
                .engine
                .as_mut()
                .and_then(|e| e.resolve_subscription(decision.token, false, Instant::now()).ok())
                .unwrap_or_default();
            Box::pin(self.process_sd_actions(actions)).await;
            return;
        };

        let pending_id = self.next_pending;
        self.next_pending += 1;
        self.pending_remote_subs.insert(pending_id, decision.token);

        self.send_to_client(
            provider,
            &Command::Subscribe {
                service: decision.service,
                instance: decision.instance,
                eventgroup: decision.eventgroup,
                major: ANY_MAJOR,
                ttl: decision.ttl,
                subscriber: ILLEGAL_CLIENT,
                pending_id,
            },
        )
        .await;
    }

    async fn on_remote_offered(&mut self, remote: sd::RemoteService) {
        let outcome = self.registry.offer(
            remote.service,
            remote.instance,
            remote.major,
            remote.minor,
            Provider::Remote {
                reliable: remote.reliable,
                unreliable: remote.unreliable,
            },
        );
        match outcome {
            OfferOutcome::Offered { interested } => {
                for observer in interested {
                    self.send_to_client(
                        observer,
                        &Command::StartService {
                            service: remote.service,
                            instance: remote.instance,
                        },
                    )
                    .await;
                }
            }
            OfferOutcome::Unchanged => {}
            OfferOutcome::Conflict => {
                log::warn!(
                    "remote offer for locally provided {:04x}.{:04x} ignored",
                    remote.service,
                    remote.instance
                );
            }
        }
    }

    async fn on_remote_expired(&mut self, service: ServiceId, instance: InstanceId) {
        let Some(interested) = self.registry.stop_offer(service, instance, false, None) else {
            return;
        };
        for observer in interested {
            self.send_to_client(observer, &Command::StopService { service, instance })
                .await;
        }
    }

    /// Our subscription to a remote eventgroup was acked or nacked: settle
    /// every pending local subscriber.
    async fn on_own_subscription_settled(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        acked: bool,
    ) {
        let state = if acked {
            SubscriptionState::Acked
        } else {
            SubscriptionState::Nacked
        };

        let pending: Vec<ClientId> = self
            .clients
            .keys()
            .copied()
            .filter(|client| {
                self.registry.subscription_state(
                    service,
                    instance,
                    eventgroup,
                    Subscriber::Local(*client),
                ) == Some(SubscriptionState::Pending)
            })
            .collect();

        for client in pending {
            self.registry.set_subscription_state(
                service,
                instance,
                eventgroup,
                Subscriber::Local(client),
                state,
            );
            let reply = if acked {
                Command::SubscribeAck {
                    service,
                    instance,
                    eventgroup,
                    subscriber: client,
                    pending_id: 0,
                }
            } else {
                Command::SubscribeNack {
                    service,
                    instance,
                    eventgroup,
                    subscriber: client,
                    pending_id: 0,
                }
            };
            self.send_to_client(client, &reply).await;
        }
    }

    async fn deliver_cached_fields_remote(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        let Some(group) = self.registry.eventgroup(service, instance, eventgroup) else {
            return;
        };
        let major = self
            .registry
            .provider(service, instance)
            .map(|si| si.major)
            .unwrap_or(DEFAULT_MAJOR);
        let fields: Vec<(EventId, Bytes)> = group
            .events
            .iter()
            .filter_map(|event| {
                self.registry.event(service, instance, *event).and_then(|e| {
                    if e.kind == EventKind::Field {
                        e.cached.clone().map(|payload| (*event, payload))
                    } else {
                        None
                    }
                })
            })
            .collect();

        for (event, payload) in fields {
            let msg = Message::notification(service, event, major, payload);
            let remote = self.registry.remote_event_targets(service, instance, event);
            for (_, _, sub_reliable, sub_unreliable) in remote {
                self.send_notification_unicast(
                    service, instance, sub_reliable, sub_unreliable, &msg,
                )
                .await;
            }
        }
    }

    /// Tells the local provider's subscription handler about a remote
    /// subscriber that went away (ttl expiry, stop subscribe, reboot).
    async fn notify_provider_unsubscribed(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        if let Some(Provider::Local { client: provider }) = self
            .registry
            .provider(service, instance)
            .map(|si| si.provider)
        {
            self.send_to_client(
                provider,
                &Command::Unsubscribe {
                    service,
                    instance,
                    eventgroup,
                    subscriber: ILLEGAL_CLIENT,
                },
            )
            .await;
        }
    }

    async fn on_peer_rebooted(&mut self, peer: SocketAddr) {
        // drop the transport state towards the rebooted peer
        let stale_tcp: Vec<SocketAddr> = self
            .tcp_clients
            .keys()
            .filter(|a| a.ip() == peer.ip())
            .copied()
            .collect();
        for addr in stale_tcp {
            if let Some(client) = self.tcp_clients.remove(&addr) {
                client.close().await;
            }
        }
        let stale_udp: Vec<SocketAddr> = self
            .udp_clients
            .keys()
            .filter(|a| a.ip() == peer.ip())
            .copied()
            .collect();
        for addr in stale_udp {
            if let Some(client) = self.udp_clients.remove(&addr) {
                client.close().await;
            }
        }
    }

    // === timers ===========================================================

    async fn on_timer(&mut self, now: Instant) {
        let actions = self
            .engine
            .as_mut()
            .map(|e| e.handle_timeout(now))
            .unwrap_or_default();
        self.process_sd_actions(actions).await;

        // cyclic field re-notification
        let due: Vec<(ServiceId, InstanceId, EventId)> = self
            .cyclic
            .iter()
            .filter(|c| c.due <= now)
            .map(|c| (c.service, c.instance, c.event))
            .collect();
        for c in self.cyclic.iter_mut() {
            if c.due <= now {
                c.due = now + c.period;
            }
        }
        for (service, instance, event) in due {
            let Some(cached) = self
                .registry
                .event(service, instance, event)
                .and_then(|e| e.cached.clone())
            else {
                continue;
            };
            let major = self
                .registry
                .provider(service, instance)
                .map(|si| si.major)
                .unwrap_or(DEFAULT_MAJOR);
            let msg = Message::notification(service, event, major, cached);
            let data = match msg.marshal(usize::MAX) {
                Ok(data) => data,
                Err(_) => continue,
            };
            self.on_notify(ILLEGAL_CLIENT, instance, true, data, None).await;
        }
    }

    // === routing state ====================================================

    async fn set_routing_state(&mut self, state: RoutingState) {
        if state == self.state {
            return;
        }
        log::info!("routing state {} -> {}", self.state, state);

        match state {
            RoutingState::Running | RoutingState::Resumed => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.resume(Instant::now());
                }
                self.state = RoutingState::Running;
                return;
            }
            RoutingState::Suspended => {
                let actions = self
                    .engine
                    .as_mut()
                    .map(|e| e.suspend())
                    .unwrap_or_default();
                self.process_sd_actions(actions).await;
            }
            RoutingState::Diagnosis => {
                let actions = self
                    .engine
                    .as_mut()
                    .map(|e| e.diagnosis())
                    .unwrap_or_default();
                self.process_sd_actions(actions).await;
            }
            RoutingState::Shutdown => {
                let actions = self
                    .engine
                    .as_mut()
                    .map(|e| e.shutdown())
                    .unwrap_or_default();
                self.process_sd_actions(actions).await;
                self.close_endpoints().await;
            }
            RoutingState::Unknown => {}
        }
        self.state = state;
    }

    async fn close_endpoints(&mut self) {
        for (_, client) in self.tcp_clients.drain() {
            client.close().await;
        }
        for (_, client) in self.udp_clients.drain() {
            client.close().await;
        }
        for (_, server) in self.tcp_servers.drain() {
            server.close();
        }
        for (_, server) in self.udp_servers.drain() {
            server.close();
        }
        for (_, server) in self.multicast_receivers.drain() {
            server.close();
        }
        if let Some(server) = self.event_receiver.take() {
            server.close();
        }
        if let Some(server) = self.sd_endpoint.take() {
            server.close();
        }
    }
}

fn reliability_from_u8(v: u8) -> Reliability {
    match v {
        0x00 => Reliability::Reliable,
        0x01 => Reliability::Unreliable,
        0x02 => Reliability::Both,
        _ => Reliability::Unknown,
    }
}

pub(crate) fn reliability_to_u8(r: Reliability) -> u8 {
    match r {
        Reliability::Reliable => 0x00,
        Reliability::Unreliable => 0x01,
        Reliability::Both => 0x02,
        Reliability::Unknown => 0xFF,
    }
}
