use crate::types::{
    EarPair, EventType, EyePair, Features, Frame, Head, HeadPose, LensState, PixelType, Point3,
    SystemEvent, VideoFrame, WeaverPosition,
};
use crate::{Result, SrError};

/// Version spoken by this client during the handshake.
pub const PROTOCOL_VERSION: u64 = 1;

// -- Packet geometry --
/// `size: u64` followed by `destination: u64`.
pub const HEADER_SIZE: usize = 16;
/// Largest packet accepted from the wire (header included).
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

// -- Stream ids (packet destination) --
pub const STREAM_CONTROL: u64 = 0;
pub const STREAM_EYE_PAIR: u64 = 1;
pub const STREAM_HEAD: u64 = 2;
pub const STREAM_HEAD_POSE: u64 = 3;
pub const STREAM_WEAVER_POSITION: u64 = 4;
pub const STREAM_VIDEO: u64 = 5;
pub const STREAM_SYSTEM_EVENT: u64 = 6;
pub const STREAM_LENS_STATE: u64 = 7;

// -- Control opcodes --
const OP_HELLO: u64 = 1;
const OP_HELLO_ACK: u64 = 2;
const OP_HELLO_REJECT: u64 = 3;
const OP_INITIALIZE: u64 = 4;
const OP_SUBSCRIBE: u64 = 5;
const OP_UNSUBSCRIBE: u64 = 6;
const OP_LENS_HINT: u64 = 7;
const OP_GOODBYE: u64 = 8;

/// One framed message between the service and the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub destination: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(destination: u64, payload: Vec<u8>) -> Self {
        Self {
            destination,
            payload,
        }
    }

    /// Packet carrying one frame on its stream.
    pub fn frame<F: Frame + Wire>(frame: &F) -> Packet {
        let mut payload = Vec::new();
        frame.encode(&mut payload);
        Packet::new(F::STREAM, payload)
    }

    pub fn control(msg: &ControlMessage) -> Packet {
        let mut payload = Vec::new();
        msg.encode(&mut payload);
        Packet::new(STREAM_CONTROL, payload)
    }

    /// Serialize to `[size, destination, payload...]`.
    pub fn encode(&self) -> Vec<u8> {
        let size = (HEADER_SIZE + self.payload.len()) as u64;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        put_u64(&mut buf, size);
        put_u64(&mut buf, self.destination);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Split one packet off the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full packet, and the
    /// number of bytes consumed otherwise.
    pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = u64::from_le_bytes(le8(&buf[0..8]));
        if size < HEADER_SIZE as u64 || size > MAX_PACKET_SIZE as u64 {
            return Err(SrError::Malformed(format!("packet size {} out of range", size)));
        }
        let size = size as usize;
        if buf.len() < size {
            return Ok(None);
        }
        let destination = u64::from_le_bytes(le8(&buf[8..16]));
        let payload = buf[HEADER_SIZE..size].to_vec();
        Ok(Some((Packet::new(destination, payload), size)))
    }

    /// Decode the payload as a frame of kind `F`, checking the destination.
    pub fn parse<F: Frame + Wire>(&self) -> Result<F> {
        if self.destination != F::STREAM {
            return Err(SrError::Malformed(format!(
                "{} frame on stream {}",
                F::NAME,
                self.destination
            )));
        }
        decode_payload(&self.payload)
    }
}

/// Decode a complete payload, rejecting trailing bytes.
pub fn decode_payload<T: Wire>(payload: &[u8]) -> Result<T> {
    let mut r = Reader::new(payload);
    let value = T::decode(&mut r)?;
    r.finish()?;
    Ok(value)
}

/// Little-endian wire encoding with explicit 64-bit field widths.
pub trait Wire: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    a
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_point(out: &mut Vec<u8>, p: &Point3) {
    put_f64(out, p.x);
    put_f64(out, p.y);
    put_f64(out, p.z);
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Cursor over a payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                SrError::Malformed(format!(
                    "truncated payload: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(le8(self.take(8)?)))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(le8(self.take(8)?)))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(le8(self.take(8)?)))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u64()? != 0)
    }

    pub fn point(&mut self) -> Result<Point3> {
        Ok(Point3::new(self.f64()?, self.f64()?, self.f64()?))
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()?;
        let len = usize::try_from(len)
            .map_err(|_| SrError::Malformed(format!("length {} too large", len)))?;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(SrError::Malformed(format!("{} trailing bytes", n))),
        }
    }
}

impl Wire for EyePair {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        put_point(out, &self.left);
        put_point(out, &self.right);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(EyePair {
            frame_id: r.u64()?,
            time: r.u64()?,
            left: r.point()?,
            right: r.point()?,
        })
    }
}

impl Wire for EarPair {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        put_point(out, &self.left);
        put_point(out, &self.right);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(EarPair {
            frame_id: r.u64()?,
            time: r.u64()?,
            left: r.point()?,
            right: r.point()?,
        })
    }
}

impl Wire for HeadPose {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        put_point(out, &self.position);
        put_point(out, &self.orientation);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(HeadPose {
            frame_id: r.u64()?,
            time: r.u64()?,
            position: r.point()?,
            orientation: r.point()?,
        })
    }
}

impl Wire for Head {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        self.pose.encode(out);
        self.eyes.encode(out);
        self.ears.encode(out);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Head {
            frame_id: r.u64()?,
            time: r.u64()?,
            pose: HeadPose::decode(r)?,
            eyes: EyePair::decode(r)?,
            ears: EarPair::decode(r)?,
        })
    }
}

impl Wire for WeaverPosition {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        put_point(out, &self.position);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(WeaverPosition {
            frame_id: r.u64()?,
            time: r.u64()?,
            position: r.point()?,
        })
    }
}

impl Wire for VideoFrame {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.frame_id);
        put_u64(out, self.time);
        put_u64(out, self.stream_id);
        put_u64(out, self.channels);
        put_u64(out, self.height);
        put_u64(out, self.width);
        put_i64(out, self.pixel_type.code());
        put_u64(out, self.crop_y);
        put_u64(out, self.crop_x);
        put_u64(out, self.original_height);
        put_u64(out, self.original_width);
        put_bytes(out, &self.data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(VideoFrame {
            frame_id: r.u64()?,
            time: r.u64()?,
            stream_id: r.u64()?,
            channels: r.u64()?,
            height: r.u64()?,
            width: r.u64()?,
            pixel_type: PixelType::from_code(r.i64()?),
            crop_y: r.u64()?,
            crop_x: r.u64()?,
            original_height: r.u64()?,
            original_width: r.u64()?,
            data: r.bytes()?.to_vec(),
        })
    }
}

impl Wire for SystemEvent {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.time);
        put_u64(out, self.event_type as u64);
        put_bytes(out, self.message.as_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let time = r.u64()?;
        let tag = r.u64()?;
        let event_type = EventType::from_u64(tag)
            .ok_or_else(|| SrError::Malformed(format!("unknown event type {}", tag)))?;
        Ok(SystemEvent {
            time,
            event_type,
            message: r.string()?,
        })
    }
}

impl Wire for LensState {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.enabled as u64);
        put_u64(out, self.by_preference as u64);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(LensState {
            enabled: r.bool()?,
            by_preference: r.bool()?,
        })
    }
}

/// Messages on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client opens the session.
    Hello { version: u64 },
    /// Service accepts the session.
    HelloAck {
        version: u64,
        features: Features,
        face_lost_delay_ms: u64,
    },
    /// Service refuses the session.
    HelloReject { reason: String },
    /// Client asks the service to start delivering.
    Initialize { lens_preference: bool },
    Subscribe { stream: u64 },
    Unsubscribe { stream: u64 },
    LensHint { enable: bool },
    /// Client is going away.
    Goodbye,
}

impl Wire for ControlMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ControlMessage::Hello { version } => {
                put_u64(out, OP_HELLO);
                put_u64(out, *version);
            }
            ControlMessage::HelloAck {
                version,
                features,
                face_lost_delay_ms,
            } => {
                put_u64(out, OP_HELLO_ACK);
                put_u64(out, *version);
                put_u64(out, features.bits());
                put_u64(out, *face_lost_delay_ms);
            }
            ControlMessage::HelloReject { reason } => {
                put_u64(out, OP_HELLO_REJECT);
                put_bytes(out, reason.as_bytes());
            }
            ControlMessage::Initialize { lens_preference } => {
                put_u64(out, OP_INITIALIZE);
                put_u64(out, *lens_preference as u64);
            }
            ControlMessage::Subscribe { stream } => {
                put_u64(out, OP_SUBSCRIBE);
                put_u64(out, *stream);
            }
            ControlMessage::Unsubscribe { stream } => {
                put_u64(out, OP_UNSUBSCRIBE);
                put_u64(out, *stream);
            }
            ControlMessage::LensHint { enable } => {
                put_u64(out, OP_LENS_HINT);
                put_u64(out, *enable as u64);
            }
            ControlMessage::Goodbye => put_u64(out, OP_GOODBYE),
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let op = r.u64()?;
        Ok(match op {
            OP_HELLO => ControlMessage::Hello { version: r.u64()? },
            OP_HELLO_ACK => ControlMessage::HelloAck {
                version: r.u64()?,
                features: Features::from_bits_truncate(r.u64()?),
                face_lost_delay_ms: r.u64()?,
            },
            OP_HELLO_REJECT => ControlMessage::HelloReject { reason: r.string()? },
            OP_INITIALIZE => ControlMessage::Initialize {
                lens_preference: r.bool()?,
            },
            OP_SUBSCRIBE => ControlMessage::Subscribe { stream: r.u64()? },
            OP_UNSUBSCRIBE => ControlMessage::Unsubscribe { stream: r.u64()? },
            OP_LENS_HINT => ControlMessage::LensHint { enable: r.bool()? },
            OP_GOODBYE => ControlMessage::Goodbye,
            other => return Err(SrError::Malformed(format!("unknown control opcode {}", other))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eye_pair() -> EyePair {
        EyePair {
            frame_id: 7,
            time: 1_700_000_000_000_000,
            left: Point3::new(-31.5, 2.25, 612.0),
            right: Point3::new(32.0, 1.75, 611.5),
        }
    }

    #[test]
    fn test_packet_header_layout() {
        let packet = Packet::frame(&eye_pair());
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 64);
        assert_eq!(&bytes[0..8], &(80u64).to_le_bytes());
        assert_eq!(&bytes[8..16], &STREAM_EYE_PAIR.to_le_bytes());
        // frameId is the first payload word
        assert_eq!(&bytes[16..24], &7u64.to_le_bytes());
    }

    #[test]
    fn test_eye_pair_identity() {
        let packet = Packet::frame(&eye_pair());
        let (decoded, used) = Packet::decode(&packet.encode()).unwrap().unwrap();
        assert_eq!(used, HEADER_SIZE + 64);
        assert_eq!(decoded.parse::<EyePair>().unwrap(), eye_pair());
    }

    #[test]
    fn test_head_and_event_identity() {
        let head = Head {
            frame_id: 3,
            time: 99,
            pose: HeadPose {
                frame_id: 3,
                time: 99,
                position: Point3::new(0.0, 20.0, 650.0),
                orientation: Point3::new(0.1, -0.2, 0.05),
            },
            eyes: eye_pair(),
            ears: EarPair {
                frame_id: 3,
                time: 99,
                left: Point3::new(-75.0, 0.0, 690.0),
                right: Point3::new(75.0, 0.0, 690.0),
            },
        };
        let packet = Packet::frame(&head);
        assert_eq!(packet.payload.len(), 16 + 3 * 64);
        assert_eq!(packet.parse::<Head>().unwrap(), head);

        let event = SystemEvent::new(42, EventType::DuplicatedResolved, "display extended ✓");
        assert_eq!(Packet::frame(&event).parse::<SystemEvent>().unwrap(), event);
    }

    #[test]
    fn test_partial_buffer_waits() {
        let bytes = Packet::frame(&eye_pair()).encode();
        assert!(Packet::decode(&bytes[..10]).unwrap().is_none());
        assert!(Packet::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_two_packets_back_to_back() {
        let mut bytes = Packet::control(&ControlMessage::Goodbye).encode();
        bytes.extend(Packet::frame(&eye_pair()).encode());
        let (first, used) = Packet::decode(&bytes).unwrap().unwrap();
        assert_eq!(first.destination, STREAM_CONTROL);
        let (second, _) = Packet::decode(&bytes[used..]).unwrap().unwrap();
        assert_eq!(second.destination, STREAM_EYE_PAIR);
    }

    #[test]
    fn test_rejects_bad_size() {
        let mut bytes = vec![0u8; 16];
        bytes[0] = 4; // smaller than the header itself
        assert!(matches!(Packet::decode(&bytes), Err(SrError::Malformed(_))));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let mut payload = Vec::new();
        eye_pair().encode(&mut payload);
        assert!(decode_payload::<EyePair>(&payload[..40]).is_err());
        payload.push(0);
        assert!(decode_payload::<EyePair>(&payload).is_err());
    }

    #[test]
    fn test_rejects_unknown_event_tag() {
        let mut payload = Vec::new();
        put_u64(&mut payload, 1);
        put_u64(&mut payload, 99);
        put_bytes(&mut payload, b"");
        assert!(decode_payload::<SystemEvent>(&payload).is_err());
    }

    #[test]
    fn test_wrong_stream_is_rejected() {
        let packet = Packet::new(STREAM_HEAD, Packet::frame(&eye_pair()).payload);
        assert!(packet.parse::<EyePair>().is_err());
    }

    #[test]
    fn test_control_hello_ack() {
        let msg = ControlMessage::HelloAck {
            version: PROTOCOL_VERSION,
            features: Features::EYE_TRACKING | Features::SYSTEM_EVENTS,
            face_lost_delay_ms: 500,
        };
        let packet = Packet::control(&msg);
        assert_eq!(decode_payload::<ControlMessage>(&packet.payload).unwrap(), msg);
    }

    #[test]
    fn test_video_frame_length_prefix() {
        let frame = VideoFrame {
            frame_id: 1,
            time: 2,
            stream_id: 0,
            channels: 1,
            height: 2,
            width: 2,
            pixel_type: PixelType::U8,
            crop_y: 0,
            crop_x: 0,
            original_height: 2,
            original_width: 2,
            data: vec![1, 2, 3, 4],
        };
        let packet = Packet::frame(&frame);
        assert_eq!(packet.payload.len(), 12 * 8 + 4);
        assert_eq!(packet.parse::<VideoFrame>().unwrap(), frame);
    }
}
