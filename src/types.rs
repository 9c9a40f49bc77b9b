use std::ops::{Add, Mul, Sub};

use crate::protocol;

/// 3-D point or vector. Units depend on the frame carrying it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Point3) -> f64 {
        let d = *self - *other;
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Linear interpolation: `t = 0` yields `self`, `t = 1` yields `other`.
    pub fn lerp(&self, other: &Point3, t: f64) -> Point3 {
        *self + (*other - *self) * t
    }
}

impl Add for Point3 {
    type Output = Point3;
    fn add(self, r: Point3) -> Point3 {
        Point3::new(self.x + r.x, self.y + r.y, self.z + r.z)
    }
}

impl Sub for Point3 {
    type Output = Point3;
    fn sub(self, r: Point3) -> Point3 {
        Point3::new(self.x - r.x, self.y - r.y, self.z - r.z)
    }
}

impl Mul<f64> for Point3 {
    type Output = Point3;
    fn mul(self, s: f64) -> Point3 {
        Point3::new(self.x * s, self.y * s, self.z * s)
    }
}

/// Positions of both eyes, millimetres in the device-anchored frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EyePair {
    /// Autoincrement frame number.
    pub frame_id: u64,
    /// Microseconds since the Unix epoch (service clock).
    pub time: u64,
    pub left: Point3,
    pub right: Point3,
}

/// Head position (mm) and orientation (pitch, yaw, roll) in radians.
///
/// Positive rotations are clockwise from the perspective of the viewer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeadPose {
    pub frame_id: u64,
    pub time: u64,
    pub position: Point3,
    pub orientation: Point3,
}

/// Positions of both ears in millimetres.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EarPair {
    pub frame_id: u64,
    pub time: u64,
    pub left: Point3,
    pub right: Point3,
}

/// Full head observation: pose, eyes and ears.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Head {
    pub frame_id: u64,
    pub time: u64,
    pub pose: HeadPose,
    pub eyes: EyePair,
    pub ears: EarPair,
}

/// The single viewpoint used by the weaver, in centimetres.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeaverPosition {
    pub frame_id: u64,
    pub time: u64,
    pub position: Point3,
}

/// Pixel element type of a [`VideoFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
    F32,
    /// Element type code this crate does not know about.
    Other(i64),
}

impl PixelType {
    pub fn code(&self) -> i64 {
        match self {
            PixelType::U8 => 0,
            PixelType::U16 => 2,
            PixelType::F32 => 5,
            PixelType::Other(code) => *code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PixelType::U8,
            2 => PixelType::U16,
            5 => PixelType::F32,
            other => PixelType::Other(other),
        }
    }
}

/// Camera image descriptor.
///
/// The pixel buffer belongs to the producing sense; listeners only see it
/// borrowed for the duration of one `accept` call.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub frame_id: u64,
    pub time: u64,
    /// Camera-side stream the image came from.
    pub stream_id: u64,
    pub channels: u64,
    pub height: u64,
    pub width: u64,
    pub pixel_type: PixelType,
    pub crop_y: u64,
    pub crop_x: u64,
    pub original_height: u64,
    pub original_width: u64,
    pub data: Vec<u8>,
}

/// Health transitions reported by the SR service.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Info = 0,
    ContextInvalid = 1,
    SRUnavailable = 2,
    SRRestored = 3,
    USBNotConnected = 4,
    USBNotConnectedResolved = 5,
    DisplayNotConnected = 6,
    DisplayNotConnectedResolved = 7,
    Duplicated = 8,
    DuplicatedResolved = 9,
    NonNativeResolution = 10,
    NonNativeResolutionResolved = 11,
    DeviceConnectedAndReady = 12,
    DeviceDisconnected = 13,
    LensOn = 14,
    LensOff = 15,
    UserFound = 16,
    UserLost = 17,
}

impl EventType {
    pub fn from_u64(tag: u64) -> Option<Self> {
        use EventType::*;
        Some(match tag {
            0 => Info,
            1 => ContextInvalid,
            2 => SRUnavailable,
            3 => SRRestored,
            4 => USBNotConnected,
            5 => USBNotConnectedResolved,
            6 => DisplayNotConnected,
            7 => DisplayNotConnectedResolved,
            8 => Duplicated,
            9 => DuplicatedResolved,
            10 => NonNativeResolution,
            11 => NonNativeResolutionResolved,
            12 => DeviceConnectedAndReady,
            13 => DeviceDisconnected,
            14 => LensOn,
            15 => LensOff,
            16 => UserFound,
            17 => UserLost,
            _ => return None,
        })
    }

    /// The `*Resolved` event that clears this condition, if it has one.
    pub fn resolved_by(&self) -> Option<EventType> {
        use EventType::*;
        match self {
            SRUnavailable => Some(SRRestored),
            USBNotConnected => Some(USBNotConnectedResolved),
            DisplayNotConnected => Some(DisplayNotConnectedResolved),
            Duplicated => Some(DuplicatedResolved),
            NonNativeResolution => Some(NonNativeResolutionResolved),
            DeviceDisconnected => Some(DeviceConnectedAndReady),
            _ => None,
        }
    }

    /// True while this condition means the display can only show 2-D content.
    pub fn blocks_stereo(&self) -> bool {
        use EventType::*;
        matches!(
            self,
            SRUnavailable
                | USBNotConnected
                | DisplayNotConnected
                | Duplicated
                | NonNativeResolution
                | DeviceDisconnected
        )
    }
}

/// A system-wide event with a variable-length message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEvent {
    /// Microseconds since the Unix epoch.
    pub time: u64,
    pub event_type: EventType,
    pub message: String,
}

impl SystemEvent {
    pub fn new(time: u64, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            time,
            event_type,
            message: message.into(),
        }
    }
}

/// Lens state as last reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LensState {
    pub enabled: bool,
    /// Whether the current state follows the application's stated preference.
    pub by_preference: bool,
}

bitflags::bitflags! {
    /// Capabilities the service announces during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        const EYE_TRACKING      = 1 << 0;
        const HEAD_TRACKING     = 1 << 1;
        const HEAD_POSE         = 1 << 2;
        const WEAVER_TRACKING   = 1 << 3;
        const CAMERA            = 1 << 4;
        const SYSTEM_EVENTS     = 1 << 5;
        const LENS_HINT         = 1 << 6;
        /// The service accepts more than one session per process.
        const PARALLEL_SESSIONS = 1 << 16;
    }
}

/// A value that travels on one typed stream.
pub trait Frame: Send + Sync + 'static {
    /// Service stream this frame kind arrives on.
    const STREAM: u64;
    const NAME: &'static str;

    /// Sequence number, for frame kinds that carry one.
    fn frame_id(&self) -> Option<u64>;
}

impl Frame for EyePair {
    const STREAM: u64 = protocol::STREAM_EYE_PAIR;
    const NAME: &'static str = "eye pair";
    fn frame_id(&self) -> Option<u64> {
        Some(self.frame_id)
    }
}

impl Frame for Head {
    const STREAM: u64 = protocol::STREAM_HEAD;
    const NAME: &'static str = "head";
    fn frame_id(&self) -> Option<u64> {
        Some(self.frame_id)
    }
}

impl Frame for HeadPose {
    const STREAM: u64 = protocol::STREAM_HEAD_POSE;
    const NAME: &'static str = "head pose";
    fn frame_id(&self) -> Option<u64> {
        Some(self.frame_id)
    }
}

impl Frame for WeaverPosition {
    const STREAM: u64 = protocol::STREAM_WEAVER_POSITION;
    const NAME: &'static str = "weaver position";
    fn frame_id(&self) -> Option<u64> {
        Some(self.frame_id)
    }
}

impl Frame for VideoFrame {
    const STREAM: u64 = protocol::STREAM_VIDEO;
    const NAME: &'static str = "video";
    fn frame_id(&self) -> Option<u64> {
        Some(self.frame_id)
    }
}

impl Frame for SystemEvent {
    const STREAM: u64 = protocol::STREAM_SYSTEM_EVENT;
    const NAME: &'static str = "system event";
    fn frame_id(&self) -> Option<u64> {
        None
    }
}

impl Frame for LensState {
    const STREAM: u64 = protocol::STREAM_LENS_STATE;
    const NAME: &'static str = "lens state";
    fn frame_id(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        for tag in 0..18 {
            let ty = EventType::from_u64(tag).unwrap();
            assert_eq!(ty as u64, tag);
        }
        assert_eq!(EventType::from_u64(18), None);
    }

    #[test]
    fn test_resolved_pairs() {
        assert_eq!(
            EventType::Duplicated.resolved_by(),
            Some(EventType::DuplicatedResolved)
        );
        assert_eq!(EventType::UserLost.resolved_by(), None);
        assert!(EventType::DisplayNotConnected.blocks_stereo());
        assert!(!EventType::LensOn.blocks_stereo());
    }

    #[test]
    fn test_point_lerp() {
        let a = Point3::new(-32.0, 0.0, 600.0);
        let b = Point3::new(0.0, 100.0, 600.0);
        assert_eq!(a.lerp(&b, 0.0), a);
        let mid = a.lerp(&b, 0.5);
        assert!((mid.x + 16.0).abs() < 1e-12);
        assert!((mid.y - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_pixel_type_codes() {
        assert_eq!(PixelType::from_code(PixelType::U16.code()), PixelType::U16);
        assert_eq!(PixelType::from_code(24), PixelType::Other(24));
    }
}
