//! The per-process application handle.
//!
//! An [`Application`] is a thin proxy: every public operation translates to
//! one local IPC command towards the routing manager. Inbound frames are
//! demultiplexed on the I/O task, but user handlers always run on the
//! application's dispatch workers so that slow callbacks never stall the
//! IPC channel (the PING/PONG keepalive in particular is answered on the
//! I/O task).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use message::types::*;
use message::{Message, MessageType, ReturnCode};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::ipc::{encode_frame, Command, IpcFrame};
use crate::routing::{self, RoutingState};

/// Lifecycle state reported to the state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Registered,
    Deregistered,
}

/// Status reported to subscription status handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Acked,
    Nacked,
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type AvailabilityHandler = Arc<dyn Fn(ServiceId, InstanceId, bool) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(AppState) + Send + Sync>;
/// Returns the acceptance verdict for an incoming subscription.
pub type SubscriptionHandler =
    Arc<dyn Fn(ServiceId, InstanceId, EventgroupId, ClientId, bool) -> bool + Send + Sync>;
pub type SubscriptionStatusHandler =
    Arc<dyn Fn(ServiceId, InstanceId, EventgroupId, SubscriptionStatus) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    state: Option<StateHandler>,
    messages: HashMap<(ServiceId, MethodId), MessageHandler>,
    availability: HashMap<(ServiceId, InstanceId), AvailabilityHandler>,
    subscriptions: HashMap<(ServiceId, InstanceId), SubscriptionHandler>,
    subscription_status: HashMap<(ServiceId, InstanceId, EventgroupId), SubscriptionStatusHandler>,
}

struct AppInner {
    name: String,
    config: Arc<Config>,
    client: AtomicU16,
    writer: mpsc::Sender<Bytes>,
    dispatcher: Dispatcher,
    handlers: Mutex<Handlers>,
    /// Session counters per method id (strictly increasing, 0 skipped).
    sessions: Mutex<HashMap<MethodId, SessionId>>,
    /// Commands to replay after (re)registration.
    registrations: Mutex<Vec<Command>>,
    availability: Mutex<HashMap<(ServiceId, InstanceId), bool>>,
    offered_services_waiters: Mutex<VecDeque<oneshot::Sender<Vec<(ServiceId, InstanceId)>>>>,
    registered_tx: watch::Sender<bool>,
}

/// Handle to one attached SOME/IP application.
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl Application {
    /// Connects to the routing manager and registers. Resolves once the
    /// APPLICATION_INFO reply assigned a client id.
    pub(crate) async fn connect(config: Arc<Config>, name: &str) -> Result<Application> {
        let (writer, frames) = routing::connect_ipc(&config).await?;
        let (registered_tx, mut registered_rx) = watch::channel(false);

        let inner = Arc::new(AppInner {
            name: name.to_owned(),
            client: AtomicU16::new(ILLEGAL_CLIENT),
            dispatcher: Dispatcher::new(
                name,
                config.dispatch_workers,
                config.dispatch_queue_watermark,
            ),
            writer,
            handlers: Mutex::new(Handlers::default()),
            sessions: Mutex::new(HashMap::new()),
            registrations: Mutex::new(vec![]),
            availability: Mutex::new(HashMap::new()),
            offered_services_waiters: Mutex::new(VecDeque::new()),
            registered_tx,
            config,
        });

        tokio::spawn(reader_loop(inner.clone(), frames));

        let requested_client = inner
            .config
            .requested_client_id(name)
            .unwrap_or(ILLEGAL_CLIENT);
        inner
            .send_command(&Command::RegisterApplication {
                name: name.to_owned(),
                requested_client,
            })
            .await?;

        // wait for APPLICATION_INFO
        let deadline = Duration::from_secs(5);
        let registered = tokio::time::timeout(deadline, async {
            loop {
                if *registered_rx.borrow() {
                    return true;
                }
                if registered_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match registered {
            Ok(true) => Ok(Application { inner }),
            _ => Err(Error::ErrNotRouting),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client(&self) -> ClientId {
        self.inner.client.load(Ordering::SeqCst)
    }

    // === provider surface =================================================

    pub async fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        let (reliable_port, unreliable_port) = self
            .inner
            .config
            .service(service, instance)
            .map(|s| {
                (
                    s.reliable_port.unwrap_or(0),
                    s.unreliable_port.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        self.inner
            .send_registration(Command::ProvideService {
                service,
                instance,
                major,
                minor,
                reliable_port,
                unreliable_port,
            })
            .await
    }

    pub async fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Result<()> {
        self.inner
            .drop_registration(|c| {
                matches!(c, Command::ProvideService { service: s, instance: i, .. }
                    if *s == service && *i == instance)
            });
        self.inner
            .send_command(&Command::WithdrawService { service, instance })
            .await
    }

    /// Declares an event or field. A non-empty initial payload (or a cycle)
    /// makes it a field whose last value new subscribers receive.
    #[allow(clippy::too_many_arguments)]
    pub async fn offer_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroups: &[EventgroupId],
        cycle: Option<Duration>,
        change_resets_cycle: bool,
        initial: Option<Bytes>,
    ) -> Result<()> {
        self.inner
            .send_registration(Command::AddField {
                service,
                instance,
                event,
                eventgroups: eventgroups.to_vec(),
                cycle_ms: cycle.map(|c| c.as_millis() as u32).unwrap_or(0),
                change_resets_cycle,
                payload: initial.unwrap_or_default(),
            })
            .await
    }

    pub async fn stop_offer_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Result<()> {
        self.inner
            .drop_registration(|c| {
                matches!(c, Command::AddField { service: s, instance: i, event: e, .. }
                    if *s == service && *i == instance && *e == event)
            });
        self.inner
            .send_command(&Command::RemoveField {
                service,
                instance,
                event,
            })
            .await
    }

    pub async fn offer_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        reliability: sd::Reliability,
        multicast: Option<std::net::SocketAddrV4>,
    ) -> Result<()> {
        self.inner
            .send_registration(Command::ProvideEventgroup {
                service,
                instance,
                eventgroup,
                reliability: crate::routing::reliability_to_u8(reliability),
                multicast_addr: multicast.map(|m| u32::from(*m.ip())).unwrap_or(0),
                multicast_port: multicast.map(|m| m.port()).unwrap_or(0),
            })
            .await
    }

    // === consumer surface =================================================

    pub async fn request_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.inner
            .send_registration(Command::RequestService {
                service,
                instance,
                major,
                minor,
            })
            .await
    }

    pub async fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<()> {
        self.inner.drop_registration(|c| {
            matches!(c, Command::RequestService { service: s, instance: i, .. }
                if *s == service && *i == instance)
        });
        self.inner
            .send_command(&Command::ReleaseService { service, instance })
            .await
    }

    pub async fn request_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroup: EventgroupId,
    ) -> Result<()> {
        self.inner
            .send_registration(Command::RequestEventgroup {
                service,
                instance,
                eventgroup,
                event,
            })
            .await
    }

    pub async fn release_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroup: EventgroupId,
    ) -> Result<()> {
        self.inner
            .send_command(&Command::ReleaseEventgroup {
                service,
                instance,
                eventgroup,
                event,
            })
            .await
    }

    pub async fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) -> Result<()> {
        self.inner
            .send_registration(Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                ttl,
                subscriber: self.client(),
                pending_id: 0,
            })
            .await
    }

    pub async fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Result<()> {
        self.inner.drop_registration(|c| {
            matches!(c, Command::Subscribe { service: s, instance: i, eventgroup: e, .. }
                if *s == service && *i == instance && *e == eventgroup)
        });
        self.inner
            .send_command(&Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                subscriber: self.client(),
            })
            .await
    }

    pub fn is_available(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.inner
            .availability
            .lock()
            .unwrap()
            .get(&(service, instance))
            .copied()
            .unwrap_or(false)
    }

    // === messaging ========================================================

    /// Sends a request, fire&forget request or response. Client id and (for
    /// requests) session id are filled in when left zero.
    pub async fn send(&self, instance: InstanceId, mut msg: Message) -> Result<()> {
        if msg.header.message_type.is_request() {
            if msg.header.client == ILLEGAL_CLIENT {
                msg.header.client = self.client();
            }
            if msg.header.session == 0 {
                msg.header.session = self.inner.next_session(msg.header.method);
            }
        }
        let data = msg.marshal(usize::MAX)?;
        self.inner
            .send_command(&Command::Send { instance, data })
            .await
    }

    /// Synchronous variant of [`Application::send`] for use inside
    /// dispatched handlers (which run off the async runtime).
    pub fn blocking_send(&self, instance: InstanceId, mut msg: Message) -> Result<()> {
        if msg.header.message_type.is_request() {
            if msg.header.client == ILLEGAL_CLIENT {
                msg.header.client = self.client();
            }
            if msg.header.session == 0 {
                msg.header.session = self.inner.next_session(msg.header.method);
            }
        }
        let data = msg.marshal(usize::MAX)?;
        let client = self.client();
        let frame = encode_frame(client, &Command::Send { instance, data });
        self.inner
            .writer
            .blocking_send(frame)
            .map_err(|_| Error::ErrIpcClosed)
    }

    pub async fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        force: bool,
    ) -> Result<()> {
        let msg = Message::notification(service, event, DEFAULT_MAJOR, payload);
        let data = msg.marshal(usize::MAX)?;
        self.inner
            .send_command(&Command::Notify {
                instance,
                force,
                data,
            })
            .await
    }

    pub async fn notify_one(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        target: ClientId,
        force: bool,
    ) -> Result<()> {
        let msg = Message::notification(service, event, DEFAULT_MAJOR, payload);
        let data = msg.marshal(usize::MAX)?;
        self.inner
            .send_command(&Command::NotifyOne {
                instance,
                target,
                force,
                data,
            })
            .await
    }

    /// Asks the routing manager for the currently offered services.
    /// offer_type: 0x00 local, 0x01 remote, anything else all.
    pub async fn get_offered_services(
        &self,
        offer_type: u8,
    ) -> Result<Vec<(ServiceId, InstanceId)>> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .offered_services_waiters
            .lock()
            .unwrap()
            .push_back(tx);
        self.inner
            .send_command(&Command::OfferedServicesRequest { offer_type })
            .await?;
        rx.await.map_err(|_| Error::ErrIpcClosed)
    }

    /// Routing-host only: change the global routing state.
    pub async fn set_routing_state(&self, state: RoutingState) -> Result<()> {
        self.inner
            .send_command(&Command::RoutingState { state })
            .await
    }

    // === handler registration =============================================

    pub fn register_state_handler<F>(&self, handler: F)
    where
        F: Fn(AppState) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().unwrap().state = Some(Arc::new(handler));
    }

    /// Registers a handler for (service, method). `ANY_METHOD` catches all
    /// methods of the service. Concrete methods are announced to the
    /// routing manager for unknown-method synthesis.
    pub async fn register_message_handler<F>(
        &self,
        service: ServiceId,
        method: MethodId,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .messages
            .insert((service, method), Arc::new(handler));
        if method != ANY_METHOD {
            self.inner
                .send_registration(Command::RegisterMethod { service, method })
                .await?;
        }
        Ok(())
    }

    pub async fn unregister_message_handler(
        &self,
        service: ServiceId,
        method: MethodId,
    ) -> Result<()> {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .messages
            .remove(&(service, method));
        if method != ANY_METHOD {
            self.inner
                .drop_registration(|c| {
                    matches!(c, Command::RegisterMethod { service: s, method: m }
                        if *s == service && *m == method)
                });
            self.inner
                .send_command(&Command::DeregisterMethod { service, method })
                .await?;
        }
        Ok(())
    }

    pub fn register_availability_handler<F>(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: F,
    ) where
        F: Fn(ServiceId, InstanceId, bool) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .availability
            .insert((service, instance), Arc::new(handler));
    }

    /// Provider-side gate for incoming subscriptions. Without a handler
    /// every subscription is accepted.
    pub fn register_subscription_handler<F>(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: F,
    ) where
        F: Fn(ServiceId, InstanceId, EventgroupId, ClientId, bool) -> bool + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .subscriptions
            .insert((service, instance), Arc::new(handler));
    }

    pub fn register_subscription_status_handler<F>(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        handler: F,
    ) where
        F: Fn(ServiceId, InstanceId, EventgroupId, SubscriptionStatus) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .subscription_status
            .insert((service, instance, eventgroup), Arc::new(handler));
    }

    /// Detaches from the routing manager.
    pub async fn stop(&self) {
        let _ = self
            .inner
            .send_command(&Command::DeregisterApplication)
            .await;
    }
}

impl AppInner {
    async fn send_command(&self, command: &Command) -> Result<()> {
        let client = self.client.load(Ordering::SeqCst);
        self.writer
            .send(encode_frame(client, command))
            .await
            .map_err(|_| Error::ErrIpcClosed)
    }

    /// Sends and remembers a registration for post-reconnect catch-up.
    async fn send_registration(&self, command: Command) -> Result<()> {
        self.send_command(&command).await?;
        self.registrations.lock().unwrap().push(command);
        Ok(())
    }

    fn drop_registration<F>(&self, matches: F)
    where
        F: Fn(&Command) -> bool,
    {
        self.registrations.lock().unwrap().retain(|c| !matches(c));
    }

    fn next_session(&self, method: MethodId) -> SessionId {
        let mut sessions = self.sessions.lock().unwrap();
        let counter = sessions.entry(method).or_insert(0);
        *counter = if *counter == 0xFFFF { 1 } else { *counter + 1 };
        *counter
    }
}

async fn reader_loop(inner: Arc<AppInner>, mut frames: mpsc::Receiver<IpcFrame>) {
    while let Some(frame) = frames.recv().await {
        handle_frame(&inner, frame).await;
    }

    log::warn!("application '{}' lost its routing channel", inner.name);
    let handler = inner.handlers.lock().unwrap().state.clone();
    if let Some(handler) = handler {
        let _ = inner
            .dispatcher
            .try_dispatch(move || handler(AppState::Deregistered));
    }
}

async fn handle_frame(inner: &Arc<AppInner>, frame: IpcFrame) {
    match frame.command {
        Command::ApplicationInfo {
            assigned_client, ..
        } => {
            inner.client.store(assigned_client, Ordering::SeqCst);
            let _ = inner.registered_tx.send(true);
            log::info!(
                "application '{}' registered as {assigned_client:#06x}",
                inner.name
            );

            // catch-up: replay everything registered so far
            let replay = inner.registrations.lock().unwrap().clone();
            for command in &replay {
                let _ = inner.send_command(command).await;
            }

            let handler = inner.handlers.lock().unwrap().state.clone();
            if let Some(handler) = handler {
                let _ = inner
                    .dispatcher
                    .try_dispatch(move || handler(AppState::Registered));
            }
        }

        // keepalive is answered on the I/O task so a busy dispatcher never
        // makes the routing manager declare us lost
        Command::Ping => {
            let _ = inner.send_command(&Command::Pong).await;
        }

        Command::ApplicationLost { client } => {
            log::debug!("peer application {client:#06x} lost");
        }

        Command::StartService { service, instance } => {
            on_availability(inner, service, instance, true);
        }
        Command::StopService { service, instance } => {
            on_availability(inner, service, instance, false);
        }
        Command::RequestServiceAck { .. } => {}

        Command::Send { data, .. } => {
            on_inbound_frame(inner, data).await;
        }

        Command::Subscribe {
            service,
            instance,
            eventgroup,
            subscriber,
            pending_id,
            ..
        } => {
            on_subscription_request(inner, service, instance, eventgroup, subscriber, pending_id)
                .await;
        }
        Command::Unsubscribe {
            service,
            instance,
            eventgroup,
            subscriber,
        } => {
            let handler = inner
                .handlers
                .lock()
                .unwrap()
                .subscriptions
                .get(&(service, instance))
                .cloned();
            if let Some(handler) = handler {
                let _ = inner.dispatcher.try_dispatch(move || {
                    let _ = handler(service, instance, eventgroup, subscriber, false);
                });
            }
        }

        Command::SubscribeAck {
            service,
            instance,
            eventgroup,
            ..
        } => {
            on_subscription_status(inner, service, instance, eventgroup, SubscriptionStatus::Acked);
        }
        Command::SubscribeNack {
            service,
            instance,
            eventgroup,
            ..
        } => {
            on_subscription_status(
                inner,
                service,
                instance,
                eventgroup,
                SubscriptionStatus::Nacked,
            );
        }

        Command::OfferedServicesResponse { services } => {
            let waiter = inner
                .offered_services_waiters
                .lock()
                .unwrap()
                .pop_front();
            if let Some(waiter) = waiter {
                let _ = waiter.send(services);
            }
        }

        other => {
            log::debug!("unhandled command {:#04x} from routing manager", other.code());
        }
    }
}

fn on_availability(inner: &Arc<AppInner>, service: ServiceId, instance: InstanceId, up: bool) {
    {
        let mut availability = inner.availability.lock().unwrap();
        // availability edges are monotone per instance
        if availability.insert((service, instance), up) == Some(up) {
            return;
        }
    }

    let handlers = inner.handlers.lock().unwrap();
    let handler = handlers
        .availability
        .get(&(service, instance))
        .or_else(|| handlers.availability.get(&(service, ANY_INSTANCE)))
        .cloned();
    drop(handlers);

    if let Some(handler) = handler {
        let _ = inner
            .dispatcher
            .try_dispatch(move || handler(service, instance, up));
    }
}

async fn on_inbound_frame(inner: &Arc<AppInner>, data: Bytes) {
    let msg = match Message::unmarshal(&data) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("malformed frame from routing manager: {e}");
            return;
        }
    };

    let handler = {
        let handlers = inner.handlers.lock().unwrap();
        handlers
            .messages
            .get(&(msg.header.service, msg.header.method))
            .or_else(|| handlers.messages.get(&(msg.header.service, ANY_METHOD)))
            .or_else(|| handlers.messages.get(&(ANY_SERVICE, ANY_METHOD)))
            .cloned()
    };

    let Some(handler) = handler else {
        log::debug!("no handler for {}", msg.header);
        return;
    };

    let needs_reply = msg.header.message_type == MessageType::Request;
    let dispatched = {
        let msg = msg.clone();
        inner.dispatcher.try_dispatch(move || handler(&msg))
    };

    if dispatched.is_err() {
        // backpressure: requests get E_NOT_READY, the rest is dropped
        if needs_reply {
            let busy = Message::error_to(&msg, ReturnCode::NotReady);
            if let Ok(data) = busy.marshal(usize::MAX) {
                let _ = inner
                    .send_command(&Command::Send { instance: 0, data })
                    .await;
            }
        } else {
            log::warn!("dispatch queue full, dropping {}", msg.header);
        }
    }
}

async fn on_subscription_request(
    inner: &Arc<AppInner>,
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    subscriber: ClientId,
    pending_id: u32,
) {
    let handler = inner
        .handlers
        .lock()
        .unwrap()
        .subscriptions
        .get(&(service, instance))
        .cloned();

    let verdict_cmd = |accept: bool| {
        if accept {
            Command::SubscribeAck {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            }
        } else {
            Command::SubscribeNack {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            }
        }
    };

    match handler {
        // no handler: accept right away
        None => {
            let _ = inner.send_command(&verdict_cmd(true)).await;
        }
        // the predicate may block; run it on the dispatcher and send the
        // verdict from there
        Some(handler) => {
            let job_inner = inner.clone();
            let dispatched = inner.dispatcher.try_dispatch(move || {
                let accept = handler(service, instance, eventgroup, subscriber, true);
                let command = if accept {
                    Command::SubscribeAck {
                        service,
                        instance,
                        eventgroup,
                        subscriber,
                        pending_id,
                    }
                } else {
                    Command::SubscribeNack {
                        service,
                        instance,
                        eventgroup,
                        subscriber,
                        pending_id,
                    }
                };
                let client = job_inner.client.load(Ordering::SeqCst);
                let _ = job_inner.writer.try_send(encode_frame(client, &command));
            });
            if dispatched.is_err() {
                log::warn!("dispatch queue full, nacking subscription");
                let _ = inner.send_command(&verdict_cmd(false)).await;
            }
        }
    }
}

fn on_subscription_status(
    inner: &Arc<AppInner>,
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    status: SubscriptionStatus,
) {
    let handler = inner
        .handlers
        .lock()
        .unwrap()
        .subscription_status
        .get(&(service, instance, eventgroup))
        .cloned();
    if let Some(handler) = handler {
        let _ = inner
            .dispatcher
            .try_dispatch(move || handler(service, instance, eventgroup, status));
    }
}
