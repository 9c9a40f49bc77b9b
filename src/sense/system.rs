use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Feed, Sense, SenseKind};
use crate::context::{Context, Link};
use crate::protocol::STREAM_SYSTEM_EVENT;
use crate::stream::{Listener, StreamHandle, StreamSet};
use crate::types::{EventType, Features, SystemEvent};
use crate::Result;

/// Service health events, delivered in emission order without loss.
///
/// A full queue holds back the demux thread instead of dropping. `ContextInvalid`
/// is always the last event a listener sees; its stream is closed right after.
pub struct SystemSense {
    link: Arc<Link>,
    feed: Feed<SystemEvent>,
    streams: Arc<StreamSet<SystemEvent>>,
    finalized: AtomicBool,
}

impl SystemSense {
    pub fn open_system_event_stream(
        &self,
        listener: Arc<dyn Listener<SystemEvent>>,
    ) -> Result<StreamHandle<SystemEvent>> {
        self.streams.open(listener)
    }

    /// Queue an event from the service. Blocks while the queue is full.
    pub(crate) fn push(&self, event: SystemEvent) {
        self.feed.push(event);
    }

    /// Deliver the final `ContextInvalid` and close every stream.
    fn finish(&self, event: SystemEvent) {
        if self.feed.is_running() {
            // The worker closes the streams once it has delivered the event.
            self.feed.push(event);
        } else {
            // Never started: flush what queued up, then finish inline.
            for queued in self.feed.retire() {
                self.streams.publish(&queued);
            }
            self.streams.publish(&event);
            self.streams.close_all(true);
        }
    }
}

impl Sense for SystemSense {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Service health and display state events"
    }

    fn start(&self) -> Result<()> {
        let streams = self.streams.clone();
        let spawned = self
            .feed
            .start(self.link.config().poll_interval, move |event: SystemEvent| {
                streams.publish(&event);
                if event.event_type == EventType::ContextInvalid {
                    streams.close_all(true);
                    return false;
                }
                true
            })?;
        if spawned {
            self.link.subscribe(STREAM_SYSTEM_EVENT)?;
        }
        Ok(())
    }

    fn stop(&self) {
        if self.feed.stop() {
            if let Err(e) = self.link.unsubscribe(STREAM_SYSTEM_EVENT) {
                log::debug!("Unsubscribe from system events skipped: {}", e);
            }
        }
        self.streams.close_all(true);
    }

    fn invalidate(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = self.link.final_event().unwrap_or_else(|| {
            SystemEvent::new(
                self.link.clock().now_us(),
                EventType::ContextInvalid,
                "context invalidated",
            )
        });
        self.finish(event);
    }

    fn open_streams(&self) -> usize {
        self.streams.external_count()
    }
}

impl SenseKind for SystemSense {
    const NAME: &'static str = "SystemSense";
    const REQUIRES: Features = Features::SYSTEM_EVENTS;

    fn build(ctx: &Context) -> Result<Self> {
        let link = ctx.link();
        let depth = link.config().event_queue_depth;
        Ok(Self {
            link,
            feed: Feed::lossless(Self::NAME, depth),
            streams: Arc::new(StreamSet::new(Self::NAME)),
            finalized: AtomicBool::new(false),
        })
    }
}
