use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::protocol::{self, ControlMessage, Packet, PROTOCOL_VERSION};
use crate::types::Features;
use crate::{Result, SrError};

/// Outbound half of a session.
pub trait PacketSink: Send {
    fn send(&mut self, packet: &Packet) -> Result<()>;
}

/// Inbound half of a session.
pub trait PacketSource: Send {
    /// Next packet, `Ok(None)` on timeout, `Err(Disconnected)` once the peer is gone.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Packet>>;
}

/// An ordered, framed, bidirectional link to the service.
pub struct Connection {
    pub sink: Box<dyn PacketSink>,
    pub source: Box<dyn PacketSource>,
}

/// Opens links to one service endpoint.
pub trait Connector: Send + Sync {
    /// Name of the endpoint, used for logging and the session guard.
    fn endpoint(&self) -> String;
    fn connect(&self) -> Result<Connection>;
}

/// What the service told us during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub service_version: u64,
    pub features: Features,
    /// Device default face-lost delay, if the service has one.
    pub face_lost_delay: Option<Duration>,
}

/// Connect, retrying with bounded exponential backoff.
pub fn connect_with_backoff(connector: &dyn Connector, config: &Config) -> Result<Connection> {
    let endpoint = connector.endpoint();
    let attempts = config.connect_attempts.max(1);

    for attempt in 1..=attempts {
        match connector.connect() {
            Ok(conn) => {
                log::info!("Connected to SR service at {} (attempt {})", endpoint, attempt);
                return Ok(conn);
            }
            Err(e) => {
                log::warn!(
                    "SR service at {} not reachable (attempt {}/{}): {}",
                    endpoint,
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    std::thread::sleep(config.backoff(attempt));
                }
            }
        }
    }

    Err(SrError::ServiceUnavailable { endpoint, attempts })
}

/// Exchange hello messages and validate the service's answer.
pub fn handshake(conn: &mut Connection, timeout: Duration) -> Result<SessionInfo> {
    conn.sink.send(&Packet::control(&ControlMessage::Hello {
        version: PROTOCOL_VERSION,
    }))?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SrError::Timeout);
        }
        let packet = match conn.source.recv_timeout(remaining)? {
            Some(p) => p,
            None => continue,
        };
        if packet.destination != protocol::STREAM_CONTROL {
            log::trace!("Ignoring packet on stream {} before handshake", packet.destination);
            continue;
        }
        match protocol::decode_payload::<ControlMessage>(&packet.payload)? {
            ControlMessage::HelloAck {
                version,
                features,
                face_lost_delay_ms,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(SrError::ProtocolMismatch {
                        client: PROTOCOL_VERSION,
                        service: version,
                    });
                }
                log::info!(
                    "Handshake complete: service v{} features {:?}",
                    version,
                    features
                );
                return Ok(SessionInfo {
                    service_version: version,
                    features,
                    face_lost_delay: (face_lost_delay_ms > 0)
                        .then(|| Duration::from_millis(face_lost_delay_ms)),
                });
            }
            ControlMessage::HelloReject { reason } => {
                return Err(SrError::HandshakeRejected(reason));
            }
            other => log::trace!("Ignoring {:?} before handshake", other),
        }
    }
}

/// TCP link to a service listening on a local port.
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
        }
    }

    /// Endpoint and timeouts taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoint.clone())
            .with_connect_timeout(config.connect_timeout)
            .with_write_timeout(config.write_timeout)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Longest a send may block on a service that stopped reading.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    fn connect(&self) -> Result<Connection> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SrError::Malformed(format!("endpoint {} did not resolve", self.addr)))?;
        // Zero timeouts are rejected by the OS.
        let connect_timeout = self.connect_timeout.max(Duration::from_millis(1));
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.write_timeout.max(Duration::from_millis(1))))?;
        let reader = stream.try_clone()?;
        Ok(Connection {
            sink: Box::new(TcpSink { stream }),
            source: Box::new(TcpSource {
                stream: reader,
                buf: Vec::with_capacity(4096),
            }),
        })
    }
}

struct TcpSink {
    stream: TcpStream,
}

impl PacketSink for TcpSink {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        match self.stream.write_all(&packet.encode()) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                log::warn!("SR service stopped reading, send timed out");
                Err(SrError::Timeout)
            }
            Err(e) => Err(map_io(e)),
        }
    }
}

/// Accumulates bytes until a whole packet is available.
struct TcpSource {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TcpSource {
    fn take_packet(&mut self) -> Result<Option<Packet>> {
        match Packet::decode(&self.buf)? {
            Some((packet, used)) => {
                self.buf.drain(..used);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}

impl PacketSource for TcpSource {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        if let Some(packet) = self.take_packet()? {
            return Ok(Some(packet));
        }

        // A zero read timeout means "block forever" to the OS.
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(SrError::Disconnected),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                self.take_packet()
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }
}

fn map_io(e: std::io::Error) -> SrError {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => SrError::Disconnected,
        _ => SrError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EyePair, Point3};
    use std::net::TcpListener;

    #[test]
    fn test_unreachable_endpoint_gives_up() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let connector = TcpConnector::new(format!("127.0.0.1:{}", port));
        let config = Config {
            connect_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            ..Config::default()
        };
        match connect_with_backoff(&connector, &config) {
            Err(SrError::ServiceUnavailable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected ServiceUnavailable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_tcp_handshake_and_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let service = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; 16];
            sock.read_exact(&mut header).unwrap();
            let size = u64::from_le_bytes(header[0..8].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; size - 16];
            sock.read_exact(&mut payload).unwrap();
            assert_eq!(
                protocol::decode_payload::<ControlMessage>(&payload).unwrap(),
                ControlMessage::Hello {
                    version: PROTOCOL_VERSION
                }
            );

            let ack = Packet::control(&ControlMessage::HelloAck {
                version: PROTOCOL_VERSION,
                features: Features::EYE_TRACKING,
                face_lost_delay_ms: 750,
            });
            let frame = Packet::frame(&EyePair {
                frame_id: 1,
                time: 10,
                left: Point3::new(-30.0, 0.0, 600.0),
                right: Point3::new(30.0, 0.0, 600.0),
            });
            // Split the second packet across writes to exercise reassembly.
            let mut bytes = ack.encode();
            bytes.extend(frame.encode());
            sock.write_all(&bytes[..30]).unwrap();
            sock.flush().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            sock.write_all(&bytes[30..]).unwrap();
        });

        let mut conn = TcpConnector::new(addr.to_string())
            .with_connect_timeout(Duration::from_secs(1))
            .connect()
            .unwrap();
        let info = handshake(&mut conn, Duration::from_secs(2)).unwrap();
        assert_eq!(info.features, Features::EYE_TRACKING);
        assert_eq!(info.face_lost_delay, Some(Duration::from_millis(750)));

        let deadline = Instant::now() + Duration::from_secs(2);
        let packet = loop {
            if let Some(p) = conn.source.recv_timeout(Duration::from_millis(50)).unwrap() {
                break p;
            }
            assert!(Instant::now() < deadline, "frame never arrived");
        };
        assert_eq!(packet.parse::<EyePair>().unwrap().frame_id, 1);
        service.join().unwrap();
    }

    #[test]
    fn test_connector_takes_timeouts_from_config() {
        let config = Config {
            endpoint: "127.0.0.1:9".into(),
            connect_timeout: Duration::from_millis(250),
            write_timeout: Duration::from_millis(40),
            ..Config::default()
        };
        let connector = TcpConnector::from_config(&config);
        assert_eq!(connector.endpoint(), "127.0.0.1:9");
        assert_eq!(connector.connect_timeout, Duration::from_millis(250));
        assert_eq!(connector.write_timeout, Duration::from_millis(40));
    }

    #[test]
    fn test_send_times_out_when_service_stops_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut conn = TcpConnector::new(addr.to_string())
            .with_write_timeout(Duration::from_millis(50))
            .connect()
            .unwrap();
        // Accepted but never read from.
        let (_idle, _) = listener.accept().unwrap();

        let chunk = Packet::new(protocol::STREAM_VIDEO, vec![0u8; 1 << 20]);
        let started = Instant::now();
        let mut result = Ok(());
        for _ in 0..256 {
            result = conn.sink.send(&chunk);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(SrError::Timeout)), "got {:?}", result);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
