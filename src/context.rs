//! A session with the SR service.
//!
//! [`Context::open`] connects (with backoff) and performs the handshake.
//! Senses are created next, then [`Context::initialize`] starts the demux
//! thread and every sense. The context turns [`ContextState::Invalid`] on
//! transport loss, on a `ContextInvalid` event from the service, or when it is
//! destroyed; an invalid context is never revived. Hosts destroy it and open a
//! new one.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, FALLBACK_FACE_LOST_DELAY};
use crate::protocol::{self, ControlMessage, Packet};
use crate::sense::{Inbox, Registry, Sense, SenseKind, SwitchableLensHint, SystemSense};
use crate::stream::lock;
use crate::transport::{self, Connector, PacketSink, PacketSource, SessionInfo, TcpConnector};
use crate::types::{EventType, Features, LensState, SystemEvent};
use crate::{Result, SrError};

/// Lifecycle of a [`Context`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized = 0,
    Running = 1,
    /// Terminal. Only destruction is left.
    Invalid = 2,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContextState::Uninitialized,
            1 => ContextState::Running,
            _ => ContextState::Invalid,
        }
    }
}

/// Session state shared with the senses. Holds no reference back to the
/// context or its registry.
pub(crate) struct Link {
    config: Config,
    clock: Arc<dyn Clock>,
    info: SessionInfo,
    face_lost_delay: Duration,
    state: AtomicU8,
    sink: Mutex<Option<Box<dyn PacketSink>>>,
    final_event: Mutex<Option<SystemEvent>>,
    lens: Mutex<LensState>,
    routes: Mutex<HashMap<u64, Arc<dyn Inbox>>>,
}

impl Link {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn face_lost_delay(&self) -> Duration {
        self.face_lost_delay
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                ContextState::Uninitialized as u8,
                ContextState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Flip to `Invalid`. Only the first caller gets `true`.
    fn mark_invalid(&self, event: SystemEvent) -> bool {
        let mut slot = lock(&self.final_event);
        if self.state.swap(ContextState::Invalid as u8, Ordering::SeqCst) == ContextState::Invalid as u8 {
            return false;
        }
        *slot = Some(event);
        true
    }

    /// The event that invalidated the context.
    pub fn final_event(&self) -> Option<SystemEvent> {
        lock(&self.final_event).clone()
    }

    pub fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        if self.state() == ContextState::Invalid {
            return Err(SrError::ContextInvalid);
        }
        match lock(&self.sink).as_mut() {
            Some(sink) => sink.send(&Packet::control(msg)),
            None => Err(SrError::ContextInvalid),
        }
    }

    pub fn subscribe(&self, stream: u64) -> Result<()> {
        self.send_control(&ControlMessage::Subscribe { stream })
    }

    pub fn unsubscribe(&self, stream: u64) -> Result<()> {
        self.send_control(&ControlMessage::Unsubscribe { stream })
    }

    pub fn route(&self, stream: u64, inbox: Arc<dyn Inbox>) {
        lock(&self.routes).insert(stream, inbox);
    }

    pub fn unroute(&self, stream: u64) {
        lock(&self.routes).remove(&stream);
    }

    fn inbox(&self, stream: u64) -> Option<Arc<dyn Inbox>> {
        lock(&self.routes).get(&stream).cloned()
    }

    pub fn lens(&self) -> LensState {
        *lock(&self.lens)
    }

    /// Say goodbye and drop the outbound half.
    fn close(&self) {
        if let Some(mut sink) = lock(&self.sink).take() {
            if let Err(e) = sink.send(&Packet::control(&ControlMessage::Goodbye)) {
                log::debug!("Goodbye not sent: {}", e);
            }
        }
        lock(&self.routes).clear();
    }
}

struct Shared {
    link: Arc<Link>,
    registry: Registry,
}

impl Shared {
    /// Close every sensor stream, then hand `event` to the system sense as
    /// the last event of this context.
    fn invalidate(&self, event: SystemEvent) {
        let message = event.message.clone();
        if !self.link.mark_invalid(event) {
            return;
        }
        log::warn!("Context invalidated: {}", message);

        let system = TypeId::of::<SystemSense>();
        for (kind, sense) in self.registry.senses() {
            if kind != system {
                sense.invalidate();
            }
        }
        if let Some(sys) = self.registry.get::<SystemSense>() {
            sys.invalidate();
        }
    }

    /// Route one inbound packet. Returns `false` once the context is over.
    fn dispatch(&self, packet: Packet) -> bool {
        match packet.destination {
            protocol::STREAM_CONTROL => {
                match protocol::decode_payload::<ControlMessage>(&packet.payload) {
                    Ok(ControlMessage::Goodbye) => {
                        let now = self.link.clock().now_us();
                        self.invalidate(SystemEvent::new(
                            now,
                            EventType::ContextInvalid,
                            "service ended the session",
                        ));
                        return false;
                    }
                    Ok(other) => log::trace!("Ignoring control message {:?}", other),
                    Err(e) => log::warn!("Dropping malformed control message: {}", e),
                }
            }
            protocol::STREAM_SYSTEM_EVENT => match packet.parse::<SystemEvent>() {
                Ok(event) if event.event_type == EventType::ContextInvalid => {
                    self.invalidate(event);
                    return false;
                }
                Ok(event) => match self.registry.get::<SystemSense>() {
                    Some(sys) => sys.push(event),
                    None => log::trace!("No system sense, dropping {:?}", event.event_type),
                },
                Err(e) => log::warn!("Dropping malformed system event: {}", e),
            },
            protocol::STREAM_LENS_STATE => match packet.parse::<LensState>() {
                Ok(state) => {
                    *lock(&self.link.lens) = state;
                    if let Some(lens) = self.registry.get::<SwitchableLensHint>() {
                        lens.update(&state);
                    }
                }
                Err(e) => log::warn!("Dropping malformed lens state: {}", e),
            },
            stream => match self.link.inbox(stream) {
                Some(inbox) => inbox.deliver(&packet),
                None => log::trace!("Nothing routed for stream {}, dropping packet", stream),
            },
        }
        true
    }
}

fn demux_loop(shared: Arc<Shared>, mut source: Box<dyn PacketSource>, stop: Arc<AtomicBool>) {
    let poll = shared.link.config().poll_interval;
    log::info!("Demux thread started");

    loop {
        if stop.load(Ordering::SeqCst) || shared.link.state() == ContextState::Invalid {
            break;
        }
        match source.recv_timeout(poll) {
            Ok(Some(packet)) => {
                if !shared.dispatch(packet) {
                    break;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Lost connection to SR service: {}", e);
                let now = shared.link.clock().now_us();
                shared.invalidate(SystemEvent::new(
                    now,
                    EventType::ContextInvalid,
                    format!("connection to SR service lost: {}", e),
                ));
                break;
            }
        }
    }

    log::info!("Demux thread stopped");
}

static SESSIONS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();

/// Process-wide count of live sessions per endpoint.
struct SessionGuard {
    endpoint: String,
}

impl SessionGuard {
    fn acquire(endpoint: &str, parallel: bool) -> Result<Self> {
        let mut sessions = lock(SESSIONS.get_or_init(Default::default));
        let count = sessions.entry(endpoint.to_string()).or_insert(0);
        if *count > 0 && !parallel {
            return Err(SrError::SessionInUse(endpoint.to_string()));
        }
        *count += 1;
        Ok(Self {
            endpoint: endpoint.to_string(),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = lock(SESSIONS.get_or_init(Default::default));
        if let Some(count) = sessions.get_mut(&self.endpoint) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                sessions.remove(&self.endpoint);
            }
        }
    }
}

/// Options for opening a [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    config: Option<Config>,
    connector: Option<Arc<dyn Connector>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to [`Config::from_env`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to TCP on `config.endpoint`.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Clock used for prediction and synthesized events. Must match the
    /// service's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connect and handshake. The context starts `Uninitialized`.
    pub fn open(self) -> Result<Context> {
        let config = self.config.unwrap_or_else(Config::from_env);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::from_config(&config)) as Arc<dyn Connector>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let endpoint = connector.endpoint();

        let mut conn = transport::connect_with_backoff(connector.as_ref(), &config)?;
        let info = transport::handshake(&mut conn, config.handshake_timeout)?;
        let session = SessionGuard::acquire(
            &endpoint,
            info.features.contains(Features::PARALLEL_SESSIONS),
        )?;

        let face_lost_delay = config
            .predictor
            .face_lost_delay
            .or(info.face_lost_delay)
            .unwrap_or(FALLBACK_FACE_LOST_DELAY);

        log::info!(
            "Context opened on {} (service v{}, face-lost delay {} ms)",
            endpoint,
            info.service_version,
            face_lost_delay.as_millis()
        );

        let link = Arc::new(Link {
            config,
            clock,
            info,
            face_lost_delay,
            state: AtomicU8::new(ContextState::Uninitialized as u8),
            sink: Mutex::new(Some(conn.sink)),
            final_event: Mutex::new(None),
            lens: Mutex::new(LensState::default()),
            routes: Mutex::new(HashMap::new()),
        });

        Ok(Context {
            shared: Arc::new(Shared {
                link,
                registry: Registry::default(),
            }),
            endpoint,
            source: Mutex::new(Some(conn.source)),
            demux: Mutex::new(None),
            demux_stop: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(Some(session)),
            torn_down: AtomicBool::new(false),
        })
    }
}

/// A session with the SR service and the root of sense and stream ownership.
pub struct Context {
    shared: Arc<Shared>,
    endpoint: String,
    source: Mutex<Option<Box<dyn PacketSource>>>,
    demux: Mutex<Option<JoinHandle<()>>>,
    demux_stop: Arc<AtomicBool>,
    session: Mutex<Option<SessionGuard>>,
    torn_down: AtomicBool,
}

impl Context {
    /// Open a context with configuration from the environment.
    pub fn open() -> Result<Context> {
        ContextBuilder::new().open()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Start the demux thread and every sense created so far, then tell the
    /// service the application is ready. Calling it on a running context is a
    /// no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut source_slot = lock(&self.source);
        match self.state() {
            ContextState::Running => return Ok(()),
            ContextState::Invalid => return Err(SrError::ContextInvalid),
            ContextState::Uninitialized => {}
        }
        let source = source_slot.take().ok_or(SrError::ContextInvalid)?;
        let link = &self.shared.link;

        if !link.mark_running() {
            return Err(SrError::ContextInvalid);
        }

        // Sense workers must be up before the demux thread routes to them.
        let started = self
            .shared
            .registry
            .senses()
            .into_iter()
            .try_for_each(|(_, sense)| sense.start());
        if let Err(e) = started {
            self.invalidate("initialize failed");
            return Err(e);
        }

        let shared = self.shared.clone();
        let stop = self.demux_stop.clone();
        let handle = thread::Builder::new()
            .name("sr-demux".into())
            .spawn(move || demux_loop(shared, source, stop))
            .map_err(|e| SrError::Thread(format!("Failed to spawn demux thread: {}", e)));
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                self.invalidate("demux thread could not be started");
                return Err(e);
            }
        };
        *lock(&self.demux) = Some(handle);

        let ready = link.send_control(&ControlMessage::Initialize {
            lens_preference: link.config.lens_preference,
        });
        if let Err(e) = ready {
            self.invalidate("initialize failed");
            return Err(e);
        }

        log::info!(
            "Context on {} initialized with {} sense(s)",
            self.endpoint,
            self.shared.registry.len()
        );
        Ok(())
    }

    /// Get the sense of kind `S`, creating it on first use.
    ///
    /// Fails with [`SrError::SenseUnavailable`] if the service lacks the
    /// feature, and with [`SrError::ContextInvalid`] on an invalid context.
    pub fn create<S: SenseKind>(&self) -> Result<Arc<S>> {
        if self.state() == ContextState::Invalid {
            return Err(SrError::ContextInvalid);
        }
        if !self.features().contains(S::REQUIRES) {
            return Err(SrError::SenseUnavailable(S::NAME));
        }
        if let Some(sense) = self.shared.registry.get::<S>() {
            return Ok(sense);
        }

        let built = Arc::new(S::build(self)?);
        let (sense, inserted) = self.shared.registry.insert(built);
        if inserted {
            log::debug!("Created sense {}", S::NAME);
            match self.state() {
                ContextState::Running => sense.start()?,
                ContextState::Invalid => {
                    sense.invalidate();
                    return Err(SrError::ContextInvalid);
                }
                ContextState::Uninitialized => {}
            }
        }
        Ok(sense)
    }

    /// The sense of kind `S`, if one was created.
    pub fn sense<S: SenseKind>(&self) -> Option<Arc<S>> {
        self.shared.registry.get::<S>()
    }

    pub fn state(&self) -> ContextState {
        self.shared.link.state()
    }

    pub fn is_valid(&self) -> bool {
        self.state() != ContextState::Invalid
    }

    pub fn features(&self) -> Features {
        self.shared.link.info.features
    }

    pub fn service_version(&self) -> u64 {
        self.shared.link.info.service_version
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.shared.link.config
    }

    /// Face-lost delay new predictors start with.
    pub fn face_lost_delay(&self) -> Duration {
        self.shared.link.face_lost_delay
    }

    /// Streams the application has opened and not yet released.
    pub fn open_streams(&self) -> usize {
        self.shared
            .registry
            .senses()
            .iter()
            .map(|(_, s)| s.open_streams())
            .sum()
    }

    pub(crate) fn link(&self) -> Arc<Link> {
        self.shared.link.clone()
    }

    fn invalidate(&self, reason: &str) {
        let now = self.shared.link.clock().now_us();
        self.shared
            .invalidate(SystemEvent::new(now, EventType::ContextInvalid, reason));
    }

    /// Tear the session down. Every stream is closed by the producer, system
    /// listeners see `ContextInvalid` last, and predictor state is dropped.
    ///
    /// Streams the application still held count as a contract violation and
    /// are reported as [`SrError::OpenStreams`] after teardown completed.
    pub fn destroy(self) -> Result<()> {
        match self.teardown() {
            0 => Ok(()),
            open => Err(SrError::OpenStreams(open)),
        }
    }

    fn teardown(&self) -> usize {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let open = self.open_streams();
        self.invalidate("context destroyed");

        self.demux_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.demux).take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::warn!("Demux thread panicked");
            }
        }

        for sense in self.shared.registry.clear().iter().rev() {
            sense.stop();
        }
        self.shared.link.close();
        lock(&self.source).take();
        lock(&self.session).take();

        if open > 0 {
            log::warn!(
                "Context on {} destroyed with {} stream(s) still open",
                self.endpoint,
                open
            );
        } else {
            log::info!("Context on {} destroyed", self.endpoint);
        }
        open
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackService, ServiceProfile};
    use crate::sense::{EyeTracker, PredictingEyeTracker, PredictingWeaverTracker};

    fn open(service: &Arc<LoopbackService>) -> Context {
        Context::builder()
            .config(Config::default())
            .connector(service.clone())
            .open()
            .unwrap()
    }

    #[test]
    fn test_state_machine() {
        let service = LoopbackService::new(ServiceProfile::default());
        let ctx = open(&service);
        assert_eq!(ctx.state(), ContextState::Uninitialized);
        ctx.initialize().unwrap();
        assert_eq!(ctx.state(), ContextState::Running);
        ctx.initialize().unwrap();
        ctx.invalidate("test");
        assert_eq!(ctx.state(), ContextState::Invalid);
        assert!(matches!(ctx.initialize(), Err(SrError::ContextInvalid)));
        assert!(matches!(
            ctx.create::<EyeTracker>(),
            Err(SrError::ContextInvalid)
        ));
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_dependencies_registered_first() {
        let service = LoopbackService::new(ServiceProfile::default());
        let ctx = open(&service);
        let weaver = ctx.create::<PredictingWeaverTracker>().unwrap();
        let names: Vec<&str> = ctx
            .shared
            .registry
            .senses()
            .iter()
            .map(|(_, s)| s.name())
            .collect();
        assert_eq!(
            names,
            vec!["EyeTracker", "PredictingEyeTracker", "PredictingWeaverTracker"]
        );
        assert!(Arc::ptr_eq(
            weaver.eye_tracker(),
            &ctx.create::<PredictingEyeTracker>().unwrap()
        ));
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_session_guard_counts_per_endpoint() {
        let a = SessionGuard::acquire("guard-test", false).unwrap();
        assert!(matches!(
            SessionGuard::acquire("guard-test", false),
            Err(SrError::SessionInUse(_))
        ));
        let b = SessionGuard::acquire("guard-test", true).unwrap();
        drop(a);
        drop(b);
        let c = SessionGuard::acquire("guard-test", false).unwrap();
        drop(c);
    }

    #[test]
    fn test_device_default_face_lost_delay() {
        let service = LoopbackService::new(ServiceProfile {
            face_lost_delay_ms: 750,
            ..ServiceProfile::default()
        });
        let ctx = open(&service);
        assert_eq!(ctx.face_lost_delay(), Duration::from_millis(750));
        let eyes = ctx.create::<PredictingEyeTracker>().unwrap();
        assert_eq!(eyes.face_lost_delay(), Duration::from_millis(750));
        drop(ctx);

        let service = LoopbackService::new(ServiceProfile {
            face_lost_delay_ms: 0,
            ..ServiceProfile::default()
        });
        let ctx = open(&service);
        assert_eq!(ctx.face_lost_delay(), FALLBACK_FACE_LOST_DELAY);
    }
}
