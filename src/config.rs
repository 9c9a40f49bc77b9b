use std::time::Duration;

use crate::types::Point3;

/// Default local endpoint of the SR service.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:7227";

/// Face-lost delay used when neither the configuration nor the device provides one.
pub const FALLBACK_FACE_LOST_DELAY: Duration = Duration::from_millis(500);

/// Session and delivery settings for a [`Context`](crate::Context).
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the SR service.
    pub endpoint: String,
    /// Connection attempts before giving up. 1 means fail fast.
    pub connect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt TCP connect timeout.
    pub connect_timeout: Duration,
    /// Longest a send to the service may block before failing.
    pub write_timeout: Duration,
    /// How long to wait for the service to answer the hello.
    pub handshake_timeout: Duration,
    /// Read timeout of the demux thread; bounds how long destroy waits for it.
    pub poll_interval: Duration,
    /// Mailbox depth of sensor senses. Older frames are dropped beyond it.
    pub sensor_queue_depth: usize,
    /// FIFO depth of the system sense. A full FIFO blocks the demux thread.
    pub event_queue_depth: usize,
    /// Lens state the application would like while it runs.
    pub lens_preference: bool,
    pub predictor: PredictorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            sensor_queue_depth: 8,
            event_queue_depth: 256,
            lens_preference: true,
            predictor: PredictorConfig::default(),
        }
    }
}

impl Config {
    /// Defaults with optional `SR_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.endpoint = read_env_string("SR_ENDPOINT", &config.endpoint);
        config.connect_attempts = read_env_u64("SR_CONNECT_ATTEMPTS", config.connect_attempts as u64)
            .clamp(1, u32::MAX as u64) as u32;
        config.event_queue_depth =
            read_env_u64("SR_EVENT_QUEUE_DEPTH", config.event_queue_depth as u64).max(1) as usize;
        config.lens_preference = read_env_bool("SR_LENS_PREFERENCE", config.lens_preference);
        if let Some(ms) = std::env::var("SR_FACE_LOST_DELAY_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.predictor.face_lost_delay = Some(Duration::from_millis(ms));
        }
        config
    }

    /// Delay before connection attempt `attempt` (1-based): doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Plausible eye positions in millimetres. Predictions are clamped into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Workspace {
    pub max_abs_x: f64,
    pub max_abs_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            max_abs_x: 400.0,
            max_abs_y: 400.0,
            min_z: 300.0,
            max_z: 1200.0,
        }
    }
}

impl Workspace {
    pub fn clamp(&self, p: Point3) -> Point3 {
        Point3::new(
            p.x.clamp(-self.max_abs_x, self.max_abs_x),
            p.y.clamp(-self.max_abs_y, self.max_abs_y),
            p.z.clamp(self.min_z, self.max_z),
        )
    }
}

/// Tuning of the eye-pair predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    /// Time without a valid sample before blending toward `neutral_pose`.
    /// `None` takes the device default announced by the service.
    pub face_lost_delay: Option<Duration>,
    /// Pose both eyes collapse to when the user is lost (mm).
    pub neutral_pose: Point3,
    pub workspace: Workspace,
    /// Variance of the white-noise acceleration model, (mm/s²)².
    pub acceleration_noise: f64,
    /// Variance of a raw eye coordinate, mm².
    pub measurement_noise: f64,
    /// Longest extrapolation past the last sample.
    pub max_horizon: Duration,
    /// Largest move of a predicted eye between two frames while blending
    /// toward or away from `neutral_pose`, mm. Zero lets blends run over half
    /// the face-lost delay regardless of distance.
    pub max_blend_step: f64,
    /// Frame rate `max_blend_step` is measured at, Hz.
    pub blend_rate_hz: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            face_lost_delay: None,
            neutral_pose: Point3::new(0.0, 100.0, 600.0),
            workspace: Workspace::default(),
            acceleration_noise: 2.5e5,
            measurement_noise: 0.25,
            max_horizon: Duration::from_millis(200),
            max_blend_step: 2.0,
            blend_rate_hz: 120.0,
        }
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
