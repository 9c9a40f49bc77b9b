//! Senses: named capabilities that turn service streams into typed listener streams.
//!
//! Sensor senses run a private worker per sense. The demux thread decodes a
//! packet and drops it into the sense's mailbox; the worker publishes it to
//! every open [`StreamSet`] listener. Mailboxes of sensor senses keep only the
//! newest frames, the system sense queues without loss.

mod camera;
mod eye;
mod head;
mod lens;
mod system;
mod weaver;

pub use camera::Camera;
pub use eye::{EyeTracker, PredictingEyeTracker};
pub use head::{HeadPoseTracker, HeadTracker};
pub use lens::SwitchableLensHint;
pub use system::SystemSense;
pub use weaver::{weaver_position, PredictingWeaverTracker, WeaverTracker};

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::context::{Context, Link};
use crate::protocol::{Packet, Wire};
use crate::stream::{lock, StreamSet};
use crate::types::{Features, Frame};
use crate::{Result, SrError};

/// How long a blocked lossless push waits before re-checking its consumer.
const BLOCKED_PUSH_RECHECK: Duration = Duration::from_millis(100);

/// A capability of the display that produces one or more typed streams.
pub trait Sense: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Subscribe to the service and begin delivering. Idempotent.
    fn start(&self) -> Result<()>;

    /// Unsubscribe and stop delivering. Idempotent.
    fn stop(&self);

    /// Producer-close every stream and refuse new ones.
    fn invalidate(&self);

    /// Streams opened by the application and not yet released.
    fn open_streams(&self) -> usize;
}

/// A sense kind that [`Context::create`] can instantiate.
pub trait SenseKind: Sense + Sized {
    const NAME: &'static str;
    /// Service features the sense cannot work without.
    const REQUIRES: Features;

    /// Construct an unattached instance. May create the senses it builds on;
    /// runs without the registry lock held.
    fn build(ctx: &Context) -> Result<Self>;
}

/// Receives packets for one service stream on the demux thread.
pub(crate) trait Inbox: Send + Sync {
    fn deliver(&self, packet: &Packet);
}

struct Entry {
    kind: TypeId,
    any: Arc<dyn Any + Send + Sync>,
    sense: Arc<dyn Sense>,
}

/// The senses of one context, at most one per kind, in creation order.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn get<S: SenseKind>(&self) -> Option<Arc<S>> {
        let entries = lock(&self.entries);
        entries
            .iter()
            .find(|e| e.kind == TypeId::of::<S>())
            .and_then(|e| e.any.clone().downcast::<S>().ok())
    }

    /// Insert `sense` unless its kind is already present. Returns the registered
    /// instance and whether it is the one passed in.
    pub fn insert<S: SenseKind>(&self, sense: Arc<S>) -> (Arc<S>, bool) {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries
            .iter()
            .find(|e| e.kind == TypeId::of::<S>())
            .and_then(|e| e.any.clone().downcast::<S>().ok())
        {
            return (existing, false);
        }
        entries.push(Entry {
            kind: TypeId::of::<S>(),
            any: sense.clone(),
            sense: sense.clone(),
        });
        (sense, true)
    }

    /// Snapshot of every sense with its kind tag.
    pub fn senses(&self) -> Vec<(TypeId, Arc<dyn Sense>)> {
        lock(&self.entries)
            .iter()
            .map(|e| (e.kind, e.sense.clone()))
            .collect()
    }

    pub fn clear(&self) -> Vec<Arc<dyn Sense>> {
        lock(&self.entries).drain(..).map(|e| e.sense).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Mailbox plus worker thread between the demux thread and a sense's listeners.
pub(crate) struct Feed<F> {
    name: &'static str,
    lossless: bool,
    tx: Sender<F>,
    rx: Receiver<F>,
    stopped: Arc<AtomicBool>,
    /// Set once the worker is gone for good. A lossless push only gives up
    /// then; before the first start it waits.
    retired: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Frame> Feed<F> {
    /// Bounded mailbox that drops the oldest frame when full.
    pub fn lossy(name: &'static str, depth: usize) -> Self {
        Self::with_mode(name, depth, false)
    }

    /// Bounded FIFO whose `push` blocks while full.
    pub fn lossless(name: &'static str, depth: usize) -> Self {
        Self::with_mode(name, depth, true)
    }

    fn with_mode(name: &'static str, depth: usize, lossless: bool) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        Self {
            name,
            lossless,
            tx,
            rx,
            stopped: Arc::new(AtomicBool::new(true)),
            retired: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: F) {
        if self.lossless {
            self.push_blocking(frame);
        } else {
            self.push_newest(frame);
        }
    }

    fn push_newest(&self, mut frame: F) {
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(f)) => {
                    if self.rx.try_recv().is_ok() {
                        log::trace!("{} mailbox full, dropping oldest frame", self.name);
                    }
                    frame = f;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn push_blocking(&self, mut frame: F) {
        loop {
            match self.tx.send_timeout(frame, BLOCKED_PUSH_RECHECK) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(f)) => {
                    if self.retired.load(Ordering::SeqCst) {
                        log::warn!("{} queue full and worker retired, dropping frame", self.name);
                        return;
                    }
                    log::trace!("{} queue full, holding back the demux thread", self.name);
                    frame = f;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    /// Spawn the worker. `handler` runs for every frame and returns `false`
    /// to end the worker. Returns `false` if a worker was already spawned.
    pub fn start<H>(&self, poll: Duration, handler: H) -> Result<bool>
    where
        H: FnMut(F) -> bool + Send + 'static,
    {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(false);
        }

        self.stopped.store(false, Ordering::SeqCst);
        self.retired.store(false, Ordering::SeqCst);
        let rx = self.rx.clone();
        let stopped = self.stopped.clone();
        let retired = self.retired.clone();
        let (name, lossless) = (self.name, self.lossless);

        let handle = thread::Builder::new()
            .name(format!("sr-{}", name.to_ascii_lowercase()))
            .spawn(move || {
                feed_loop(name, rx, stopped, lossless, poll, handler);
                retired.store(true, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.stopped.store(true, Ordering::SeqCst);
                self.retired.store(true, Ordering::SeqCst);
                SrError::Thread(format!("Failed to spawn {} worker: {}", name, e))
            })?;
        *worker = Some(handle);
        Ok(true)
    }

    /// Stop and join the worker, discarding undelivered sensor frames. A
    /// lossless feed delivers what is already queued first. Returns whether a
    /// worker had been spawned.
    pub fn stop(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        self.retired.store(true, Ordering::SeqCst);
        let handle = match lock(&self.worker).take() {
            Some(h) => h,
            None => return false,
        };
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            log::warn!("{} worker panicked", self.name);
        }
        while self.rx.try_recv().is_ok() {}
        true
    }

    /// Give up on a feed whose worker never ran and hand back what was queued,
    /// oldest first.
    pub fn retire(&self) -> Vec<F> {
        self.stopped.store(true, Ordering::SeqCst);
        self.retired.store(true, Ordering::SeqCst);
        self.rx.try_iter().collect()
    }
}

impl<F> Drop for Feed<F> {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.retired.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.worker).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<F: Frame + Wire> Inbox for Feed<F> {
    fn deliver(&self, packet: &Packet) {
        match packet.parse::<F>() {
            Ok(frame) => self.push(frame),
            Err(e) => log::warn!("Dropping malformed {} frame: {}", F::NAME, e),
        }
    }
}

fn feed_loop<F, H>(
    name: &'static str,
    rx: Receiver<F>,
    stopped: Arc<AtomicBool>,
    lossless: bool,
    poll: Duration,
    mut handler: H,
) where
    H: FnMut(F) -> bool,
{
    log::info!("{} worker started", name);

    loop {
        if stopped.load(Ordering::SeqCst) && !(lossless && !rx.is_empty()) {
            break;
        }
        match rx.recv_timeout(poll) {
            Ok(frame) => {
                if !handler(frame) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stopped.store(true, Ordering::SeqCst);
    log::info!("{} worker stopped", name);
}

/// Drops frames that would break per-stream `frame_id` monotonicity.
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    last: Option<u64>,
}

impl Sequencer {
    pub fn admit<F: Frame>(&mut self, frame: &F) -> bool {
        let id = match frame.frame_id() {
            Some(id) => id,
            None => return true,
        };
        if matches!(self.last, Some(last) if id <= last) {
            log::trace!("Dropping stale {} frame {}", F::NAME, id);
            return false;
        }
        self.last = Some(id);
        true
    }
}

/// One service stream relayed unchanged to listeners through a lossy mailbox.
pub(crate) struct Relay<F: Frame + Wire> {
    link: Arc<Link>,
    feed: Arc<Feed<F>>,
    streams: Arc<StreamSet<F>>,
}

impl<F: Frame + Wire> Relay<F> {
    pub fn new(link: Arc<Link>, sense: &'static str) -> Self {
        let depth = link.config().sensor_queue_depth;
        Self {
            link,
            feed: Arc::new(Feed::lossy(sense, depth)),
            streams: Arc::new(StreamSet::new(sense)),
        }
    }

    pub fn streams(&self) -> &StreamSet<F> {
        &self.streams
    }

    pub fn start(&self) -> Result<()> {
        let streams = self.streams.clone();
        let mut sequencer = Sequencer::default();
        let spawned = self.feed.start(self.link.config().poll_interval, move |frame: F| {
            if sequencer.admit(&frame) {
                streams.publish(&frame);
            }
            true
        })?;
        if spawned {
            self.link.route(F::STREAM, self.feed.clone());
            self.link.subscribe(F::STREAM)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.feed.stop() {
            self.link.unroute(F::STREAM);
            if let Err(e) = self.link.unsubscribe(F::STREAM) {
                log::debug!("Unsubscribe from {} skipped: {}", F::NAME, e);
            }
        }
    }

    pub fn invalidate(&self) {
        self.streams.close_all(true);
    }

    pub fn open_streams(&self) -> usize {
        self.streams.external_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EyePair, Point3};
    use std::sync::atomic::AtomicUsize;

    fn pair(id: u64) -> EyePair {
        EyePair {
            frame_id: id,
            time: id * 10_000,
            left: Point3::new(-30.0, 0.0, 600.0),
            right: Point3::new(30.0, 0.0, 600.0),
        }
    }

    #[test]
    fn test_lossy_feed_keeps_newest() {
        let feed: Feed<EyePair> = Feed::lossy("test", 3);
        for id in 1..=10 {
            feed.push(pair(id));
        }
        let kept: Vec<u64> = feed.rx.try_iter().map(|p| p.frame_id).collect();
        assert_eq!(kept, vec![8, 9, 10]);
    }

    #[test]
    fn test_lossless_feed_drains_on_stop() {
        let feed: Feed<EyePair> = Feed::lossless("test", 16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        assert!(feed
            .start(Duration::from_millis(5), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap());
        for id in 1..=10 {
            feed.push(pair(id));
        }
        assert!(feed.stop());
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert!(!feed.is_running());
    }

    #[test]
    fn test_feed_start_is_idempotent_and_handler_can_end_it() {
        let feed: Feed<EyePair> = Feed::lossy("test", 4);
        assert!(feed.start(Duration::from_millis(5), |p| p.frame_id < 2).unwrap());
        assert!(!feed.start(Duration::from_millis(5), |_| true).unwrap());
        feed.push(pair(1));
        feed.push(pair(2));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while feed.is_running() {
            assert!(std::time::Instant::now() < deadline, "worker never ended");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(feed.stop());
        assert!(!feed.stop());
    }

    #[test]
    fn test_lossless_push_waits_for_first_start() {
        let feed: Arc<Feed<EyePair>> = Arc::new(Feed::lossless("test", 2));
        feed.push(pair(1));
        feed.push(pair(2));
        let pusher = {
            let feed = feed.clone();
            thread::spawn(move || feed.push(pair(3)))
        };
        // Longer than a recheck: the blocked push must not give up yet.
        thread::sleep(BLOCKED_PUSH_RECHECK * 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(feed
            .start(Duration::from_millis(5), move |p| {
                lock(&sink).push(p.frame_id);
                true
            })
            .unwrap());
        pusher.join().unwrap();
        assert!(feed.stop());
        assert_eq!(*lock(&seen), vec![1, 2, 3]);
    }

    #[test]
    fn test_retired_feed_drops_instead_of_blocking() {
        let feed: Feed<EyePair> = Feed::lossless("test", 1);
        feed.push(pair(1));
        let queued: Vec<u64> = feed.retire().iter().map(|p| p.frame_id).collect();
        assert_eq!(queued, vec![1]);
        feed.push(pair(2));
        // Full again and nobody will ever drain it.
        feed.push(pair(3));
        assert!(!feed.is_running());
    }

    #[test]
    fn test_sequencer_rejects_stale_ids() {
        let mut seq = Sequencer::default();
        assert!(seq.admit(&pair(1)));
        assert!(seq.admit(&pair(3)));
        assert!(!seq.admit(&pair(3)));
        assert!(!seq.admit(&pair(2)));
        assert!(seq.admit(&pair(4)));
    }
}
