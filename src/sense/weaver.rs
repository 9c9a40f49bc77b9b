use std::sync::Arc;
use std::time::Duration;

use super::{PredictingEyeTracker, Relay, Sense, SenseKind};
use crate::context::Context;
use crate::stream::{Listener, StreamHandle};
use crate::types::{EyePair, Features, WeaverPosition};
use crate::Result;

/// Cyclopean midpoint of a predicted eye pair, converted from mm to cm.
pub fn weaver_position(pair: &EyePair) -> WeaverPosition {
    WeaverPosition {
        frame_id: pair.frame_id,
        time: pair.time,
        position: (pair.left + pair.right) * 0.05,
    }
}

/// Weaver positions computed by the service.
pub struct WeaverTracker {
    relay: Relay<WeaverPosition>,
}

impl WeaverTracker {
    pub fn open_weaver_position_stream(
        &self,
        listener: Arc<dyn Listener<WeaverPosition>>,
    ) -> Result<StreamHandle<WeaverPosition>> {
        self.relay.streams().open(listener)
    }
}

impl Sense for WeaverTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Weaver position in centimetres as reported by the service"
    }

    fn start(&self) -> Result<()> {
        self.relay.start()
    }

    fn stop(&self) {
        self.relay.stop()
    }

    fn invalidate(&self) {
        self.relay.invalidate()
    }

    fn open_streams(&self) -> usize {
        self.relay.open_streams()
    }
}

impl SenseKind for WeaverTracker {
    const NAME: &'static str = "WeaverTracker";
    const REQUIRES: Features = Features::WEAVER_TRACKING;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            relay: Relay::new(ctx.link(), Self::NAME),
        })
    }
}

/// Weaver position derived from the predicting eye tracker.
///
/// Every prediction, whichever tracker it is requested from, publishes the eye
/// pair first and its weaver position second.
pub struct PredictingWeaverTracker {
    eyes: Arc<PredictingEyeTracker>,
}

impl PredictingWeaverTracker {
    pub fn open_weaver_position_stream(
        &self,
        listener: Arc<dyn Listener<WeaverPosition>>,
    ) -> Result<StreamHandle<WeaverPosition>> {
        self.eyes.open_weaver_stream(listener)
    }

    pub fn predict(&self, latency_us: u64) -> WeaverPosition {
        weaver_position(&self.eyes.predict(latency_us))
    }

    pub fn predict_into(&self, latency_us: u64, out: &mut WeaverPosition) {
        *out = self.predict(latency_us);
    }

    pub fn set_face_lost_delay(&self, delay: Duration) {
        self.eyes.set_face_lost_delay(delay);
    }

    pub fn face_lost_delay(&self) -> Duration {
        self.eyes.face_lost_delay()
    }

    pub fn eye_tracker(&self) -> &Arc<PredictingEyeTracker> {
        &self.eyes
    }
}

// Lifecycle and streams belong to the underlying eye tracker.
impl Sense for PredictingWeaverTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Predicted weaver position in centimetres"
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn invalidate(&self) {}

    fn open_streams(&self) -> usize {
        0
    }
}

impl SenseKind for PredictingWeaverTracker {
    const NAME: &'static str = "PredictingWeaverTracker";
    const REQUIRES: Features = Features::WEAVER_TRACKING;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            eyes: ctx.create::<PredictingEyeTracker>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point3;

    #[test]
    fn test_weaver_position_is_midpoint_in_cm() {
        let pair = EyePair {
            frame_id: 7,
            time: 1234,
            left: Point3::new(-32.0, 10.0, 600.0),
            right: Point3::new(30.0, 14.0, 620.0),
        };
        let w = weaver_position(&pair);
        assert_eq!(w.frame_id, 7);
        assert_eq!(w.time, 1234);
        assert!((w.position.x - -0.1).abs() < 1e-12);
        assert!((w.position.y - 1.2).abs() < 1e-12);
        assert!((w.position.z - 61.0).abs() < 1e-12);
    }
}
