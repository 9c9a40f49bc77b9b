//! In-process stand-in for the SR service.
//!
//! Speaks the same packet protocol as the real service over crossbeam channels.
//! Used by the test suite and by hosts that replay recorded sessions offline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::protocol::{self, ControlMessage, Packet, Wire, PROTOCOL_VERSION};
use crate::transport::{Connection, Connector, PacketSink, PacketSource};
use crate::types::{Features, Frame, LensState};
use crate::{Result, SrError};

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// How the simulated service behaves.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub version: u64,
    pub features: Features,
    pub face_lost_delay_ms: u64,
    /// Answer every hello with this rejection.
    pub reject: Option<String>,
    /// Refuse this many connection attempts before accepting.
    pub refuse_connections: u32,
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            features: Features::all(),
            face_lost_delay_ms: 500,
            reject: None,
            refuse_connections: 0,
        }
    }
}

/// A simulated service endpoint. Each successful connect produces one
/// [`ServiceSession`], collected with [`LoopbackService::accept`].
pub struct LoopbackService {
    endpoint: String,
    profile: ServiceProfile,
    attempts: AtomicU32,
    sessions_tx: Sender<ServiceSession>,
    sessions_rx: Receiver<ServiceSession>,
}

impl LoopbackService {
    pub fn new(profile: ServiceProfile) -> Arc<Self> {
        let (sessions_tx, sessions_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            endpoint: format!(
                "loopback-{}",
                NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed)
            ),
            profile,
            attempts: AtomicU32::new(0),
            sessions_tx,
            sessions_rx,
        })
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Next session opened by a client.
    pub fn accept(&self, timeout: Duration) -> Result<ServiceSession> {
        self.sessions_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SrError::Timeout,
            RecvTimeoutError::Disconnected => SrError::Disconnected,
        })
    }
}

impl Connector for LoopbackService {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn connect(&self) -> Result<Connection> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.profile.refuse_connections {
            return Err(SrError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "loopback service refused connection",
            )));
        }

        let (to_client_tx, to_client_rx) = crossbeam_channel::unbounded();
        let (to_service_tx, to_service_rx) = crossbeam_channel::unbounded();
        let to_client = Arc::new(Mutex::new(Some(to_client_tx)));

        let session = ServiceSession {
            to_client: to_client.clone(),
            from_client: to_service_rx,
        };
        self.sessions_tx
            .send(session)
            .map_err(|_| SrError::Disconnected)?;

        Ok(Connection {
            sink: Box::new(LoopbackSink {
                profile: self.profile.clone(),
                to_service: to_service_tx,
                to_client,
            }),
            source: Box::new(LoopbackSource { rx: to_client_rx }),
        })
    }
}

/// Service side of one session.
pub struct ServiceSession {
    to_client: Arc<Mutex<Option<Sender<Packet>>>>,
    from_client: Receiver<Packet>,
}

impl ServiceSession {
    /// Emit one frame on its stream.
    pub fn send<F: Frame + Wire>(&self, frame: &F) -> Result<()> {
        self.send_packet(Packet::frame(frame))
    }

    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        push(&self.to_client, packet)
    }

    /// Next control message the client sent, skipping nothing.
    pub fn recv_control(&self, timeout: Duration) -> Result<ControlMessage> {
        let packet = self.from_client.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SrError::Timeout,
            RecvTimeoutError::Disconnected => SrError::Disconnected,
        })?;
        protocol::decode_payload(&packet.payload)
    }

    /// Drain every control message received so far.
    pub fn control_log(&self) -> Vec<ControlMessage> {
        self.from_client
            .try_iter()
            .filter_map(|p| protocol::decode_payload(&p.payload).ok())
            .collect()
    }

    /// Drop the link as if the service had crashed. Already queued packets
    /// are still delivered.
    pub fn disconnect(&self) {
        let mut guard = self.to_client.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }
}

impl Drop for ServiceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn push(to_client: &Mutex<Option<Sender<Packet>>>, packet: Packet) -> Result<()> {
    let guard = to_client.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(tx) => tx.send(packet).map_err(|_| SrError::Disconnected),
        None => Err(SrError::Disconnected),
    }
}

struct LoopbackSink {
    profile: ServiceProfile,
    to_service: Sender<Packet>,
    to_client: Arc<Mutex<Option<Sender<Packet>>>>,
}

impl LoopbackSink {
    /// Replies the service produces for a control message.
    fn answer(&self, msg: &ControlMessage) -> Option<Packet> {
        match msg {
            ControlMessage::Hello { .. } => Some(Packet::control(&match &self.profile.reject {
                Some(reason) => ControlMessage::HelloReject {
                    reason: reason.clone(),
                },
                None => ControlMessage::HelloAck {
                    version: self.profile.version,
                    features: self.profile.features,
                    face_lost_delay_ms: self.profile.face_lost_delay_ms,
                },
            })),
            ControlMessage::Initialize { lens_preference } => Some(Packet::frame(&LensState {
                enabled: *lens_preference,
                by_preference: true,
            })),
            ControlMessage::LensHint { enable } => Some(Packet::frame(&LensState {
                enabled: *enable,
                by_preference: false,
            })),
            _ => None,
        }
    }
}

impl PacketSink for LoopbackSink {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        if packet.destination == protocol::STREAM_CONTROL {
            let msg = protocol::decode_payload::<ControlMessage>(&packet.payload)?;
            if let Some(reply) = self.answer(&msg) {
                push(&self.to_client, reply)?;
            }
        }
        self.to_service
            .send(packet.clone())
            .map_err(|_| SrError::Disconnected)
    }
}

struct LoopbackSource {
    rx: Receiver<Packet>,
}

impl PacketSource for LoopbackSource {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SrError::Disconnected),
        }
    }
}
