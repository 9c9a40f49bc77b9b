use std::sync::Arc;

use super::{Relay, Sense, SenseKind};
use crate::context::Context;
use crate::stream::{Listener, StreamHandle};
use crate::types::{Features, Head, HeadPose};
use crate::Result;

/// Full head observations: pose, eyes and ears in one frame.
pub struct HeadTracker {
    relay: Relay<Head>,
}

impl HeadTracker {
    pub fn open_head_stream(&self, listener: Arc<dyn Listener<Head>>) -> Result<StreamHandle<Head>> {
        self.relay.streams().open(listener)
    }
}

impl Sense for HeadTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Head pose with eye and ear positions"
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

impl SenseKind for HeadTracker {
    const NAME: &'static str = "HeadTracker";
    const REQUIRES: Features = Features::HEAD_TRACKING;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            relay: Relay::new(ctx.link(), Self::NAME),
        })
    }
}

/// Head position and orientation only.
pub struct HeadPoseTracker {
    relay: Relay<HeadPose>,
}

impl HeadPoseTracker {
    pub fn open_head_pose_stream(
        &self,
        listener: Arc<dyn Listener<HeadPose>>,
    ) -> Result<StreamHandle<HeadPose>> {
        self.relay.streams().open(listener)
    }
}

impl Sense for HeadPoseTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Head position in millimetres and orientation in radians"
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

impl SenseKind for HeadPoseTracker {
    const NAME: &'static str = "HeadPoseTracker";
    const REQUIRES: Features = Features::HEAD_POSE;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            relay: Relay::new(ctx.link(), Self::NAME),
        })
    }
}
