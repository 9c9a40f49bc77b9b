//! # srsense - sense streaming core for simulated-reality displays
//!
//! Client-side runtime for an autostereoscopic display service. Provides:
//! - A session ([`Context`]) with bounded-backoff connect and handshake
//! - Typed sense streams (eyes, head, head pose, weaver position, camera,
//!   system events, lens state) with per-stream FIFO delivery
//! - A low-latency eye-pair predictor that collapses to mono when the viewer
//!   is lost
//!
//! ## Quick Start
//! ```no_run
//! use srsense::{Context, PredictingWeaverTracker, SystemEvent, SystemSense};
//! use std::sync::Arc;
//!
//! let ctx = Context::open().unwrap();
//! let events = ctx.create::<SystemSense>().unwrap();
//! let weaver = ctx.create::<PredictingWeaverTracker>().unwrap();
//! let stream = events
//!     .open_system_event_stream(Arc::new(|e: &SystemEvent| {
//!         println!("{:?}: {}", e.event_type, e.message);
//!     }))
//!     .unwrap();
//! ctx.initialize().unwrap();
//!
//! for _ in 0..100 {
//!     let position = weaver.predict(16_000);
//!     println!("weave for {:?} cm", position.position);
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! drop(stream);
//! ctx.destroy().unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod loopback;
pub mod predictor;
pub mod protocol;
pub mod sense;
pub mod stream;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, PredictorConfig, Workspace};
pub use context::{Context, ContextBuilder, ContextState};
pub use error::SrError;
pub use predictor::EyePairPredictor;
pub use sense::{
    Camera, EyeTracker, HeadPoseTracker, HeadTracker, PredictingEyeTracker,
    PredictingWeaverTracker, Sense, SenseKind, SwitchableLensHint, SystemSense, WeaverTracker,
};
pub use stream::{Listener, Stream, StreamHandle, StreamSet, StreamState};
pub use types::*;

/// Result type alias for srsense operations.
pub type Result<T> = std::result::Result<T, SrError>;
