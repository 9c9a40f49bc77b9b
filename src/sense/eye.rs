use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Relay, Sense, SenseKind};
use crate::context::{Context, Link};
use crate::predictor::EyePairPredictor;
use crate::stream::{lock, Listener, StreamHandle, StreamSet};
use crate::types::{EyePair, Features, WeaverPosition};
use crate::Result;

/// Raw eye positions as the service reports them.
pub struct EyeTracker {
    relay: Relay<EyePair>,
}

impl EyeTracker {
    pub fn open_eye_pair_stream(
        &self,
        listener: Arc<dyn Listener<EyePair>>,
    ) -> Result<StreamHandle<EyePair>> {
        self.relay.streams().open(listener)
    }

    pub(crate) fn open_internal(
        &self,
        listener: Arc<dyn Listener<EyePair>>,
    ) -> Result<StreamHandle<EyePair>> {
        self.relay.streams().open_internal(listener)
    }
}

impl Sense for EyeTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Raw left and right eye positions in millimetres"
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

impl SenseKind for EyeTracker {
    const NAME: &'static str = "EyeTracker";
    const REQUIRES: Features = Features::EYE_TRACKING;

    fn build(ctx: &Context) -> Result<Self> {
        Ok(Self {
            relay: Relay::new(ctx.link(), Self::NAME),
        })
    }
}

/// Eye positions filtered and extrapolated to the moment the next frame is
/// shown. Also drives the predicted weaver position.
pub struct PredictingEyeTracker {
    link: Arc<Link>,
    source: Arc<EyeTracker>,
    predictor: Arc<Mutex<EyePairPredictor>>,
    input: Mutex<Option<StreamHandle<EyePair>>>,
    /// Held across id assignment and publishing so ids reach listeners in order.
    emit: Mutex<()>,
    next_frame_id: AtomicU64,
    streams: StreamSet<EyePair>,
    weaver_streams: StreamSet<WeaverPosition>,
}

impl PredictingEyeTracker {
    pub fn open_eye_pair_stream(
        &self,
        listener: Arc<dyn Listener<EyePair>>,
    ) -> Result<StreamHandle<EyePair>> {
        self.streams.open(listener)
    }

    pub(crate) fn open_weaver_stream(
        &self,
        listener: Arc<dyn Listener<WeaverPosition>>,
    ) -> Result<StreamHandle<WeaverPosition>> {
        self.weaver_streams.open(listener)
    }

    /// Predict where the eyes will be `latency_us` from now, publish the
    /// result to eye-pair listeners, then publish its weaver position.
    ///
    /// Listeners of this sense must not call `predict` from `accept`.
    pub fn predict(&self, latency_us: u64) -> EyePair {
        let _emit = lock(&self.emit);
        let now = self.link.clock().now_us();
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
        let pair = lock(&self.predictor).predict_pair(now, latency_us, frame_id);

        self.streams.publish(&pair);
        self.weaver_streams.publish(&super::weaver_position(&pair));
        pair
    }

    /// [`predict`](Self::predict) writing into a caller-owned frame.
    pub fn predict_into(&self, latency_us: u64, out: &mut EyePair) {
        *out = self.predict(latency_us);
    }

    pub fn set_face_lost_delay(&self, delay: Duration) {
        log::debug!("Face-lost delay set to {} ms", delay.as_millis());
        lock(&self.predictor).set_face_lost_delay(delay);
    }

    pub fn face_lost_delay(&self) -> Duration {
        lock(&self.predictor).face_lost_delay()
    }

    /// Whether a viewer was seen within the face-lost delay.
    pub fn is_tracking(&self) -> bool {
        lock(&self.predictor).is_tracking(self.link.clock().now_us())
    }
}

impl Sense for PredictingEyeTracker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Filtered eye positions extrapolated to display time"
    }

    fn start(&self) -> Result<()> {
        let mut input = lock(&self.input);
        if input.is_some() {
            return Ok(());
        }
        let predictor = self.predictor.clone();
        let handle = self.source.open_internal(Arc::new(move |sample: &EyePair| {
            lock(&predictor).ingest(sample);
        }))?;
        *input = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = lock(&self.input).take() {
            handle.stop_listening();
        }
        lock(&self.predictor).reset();
    }

    fn invalidate(&self) {
        self.streams.close_all(true);
        self.weaver_streams.close_all(true);
    }

    fn open_streams(&self) -> usize {
        self.streams.external_count() + self.weaver_streams.external_count()
    }
}

impl SenseKind for PredictingEyeTracker {
    const NAME: &'static str = "PredictingEyeTracker";
    const REQUIRES: Features = Features::EYE_TRACKING;

    fn build(ctx: &Context) -> Result<Self> {
        let source = ctx.create::<EyeTracker>()?;
        let link = ctx.link();
        let predictor = EyePairPredictor::new(link.config().predictor.clone(), link.face_lost_delay());
        Ok(Self {
            link,
            source,
            predictor: Arc::new(Mutex::new(predictor)),
            input: Mutex::new(None),
            emit: Mutex::new(()),
            next_frame_id: AtomicU64::new(0),
            streams: StreamSet::new(Self::NAME),
            weaver_streams: StreamSet::new("PredictingWeaverTracker"),
        })
    }
}
