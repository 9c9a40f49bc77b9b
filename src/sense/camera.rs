use std::sync::Arc;

use super::{Relay, Sense, SenseKind};
use crate::context::Context;
use crate::stream::{Listener, StreamHandle};
use crate::types::{Features, VideoFrame};
use crate::Result;

/// Images from the tracking camera. Slow listeners see only the newest images.
pub struct Camera {
    relay: Relay<VideoFrame>,
}

impl Camera {
    pub fn open_video_stream(
        &self,
        listener: Arc<dyn Listener<VideoFrame>>,
    ) -> Result<StreamHandle<VideoFrame>> {
        self.relay.streams().open(listener)
    }
}

impl Sense for Camera {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Tracking camera images"
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

impl SenseKind for Camera {
    const NAME: &'static str = "Camera";
    const REQUIRES: Features = Features::CAMERA;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            relay: Relay::new(ctx.link(), Self::NAME),
        })
    }
}
