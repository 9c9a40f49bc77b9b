use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Sense, SenseKind};
use crate::context::{Context, Link};
use crate::protocol::{ControlMessage, STREAM_LENS_STATE};
use crate::stream::{Listener, StreamHandle, StreamSet};
use crate::types::{Features, LensState};
use crate::Result;

/// Switches the lenticular lens and reports its state.
///
/// Lens changes are requests; the state only flips once the service reports
/// it. State updates are delivered on the demux thread.
pub struct SwitchableLensHint {
    link: Arc<Link>,
    started: AtomicBool,
    streams: StreamSet<LensState>,
}

impl SwitchableLensHint {
    pub fn enable(&self) -> Result<()> {
        self.request(true)
    }

    pub fn disable(&self) -> Result<()> {
        self.request(false)
    }

    fn request(&self, enable: bool) -> Result<()> {
        log::debug!("Requesting lens {}", if enable { "on" } else { "off" });
        self.link.send_control(&ControlMessage::LensHint { enable })
    }

    /// Last state reported by the service.
    pub fn is_enabled(&self) -> bool {
        self.link.lens().enabled
    }

    /// Whether the current state follows the preference sent at initialize.
    pub fn is_enabled_by_preference(&self) -> bool {
        self.link.lens().by_preference
    }

    pub fn open_lens_state_stream(
        &self,
        listener: Arc<dyn Listener<LensState>>,
    ) -> Result<StreamHandle<LensState>> {
        self.streams.open(listener)
    }

    pub(crate) fn update(&self, state: &LensState) {
        self.streams.publish(state);
    }
}

impl Sense for SwitchableLensHint {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Lens switching hint"
    }

    fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.link.subscribe(STREAM_LENS_STATE)?;
        }
        Ok(())
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.link.unsubscribe(STREAM_LENS_STATE) {
                log::debug!("Unsubscribe from lens state skipped: {}", e);
            }
        }
    }

    fn invalidate(&self) {
        self.streams.close_all(true);
    }

    fn open_streams(&self) -> usize {
        self.streams.external_count()
    }
}

impl SenseKind for SwitchableLensHint {
    const NAME: &'static str = "SwitchableLensHint";
    const REQUIRES: Features = Features::LENS_HINT;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            link: ctx.link(),
            started: AtomicBool::new(false),
            streams: StreamSet::new(Self::NAME),
        })
    }
}
