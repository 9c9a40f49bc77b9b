use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::{Result, SrError};

/// Receives frames of kind `F` from one stream.
///
/// `accept` is never called concurrently or re-entrantly for the same stream;
/// the next frame is only issued after the previous call returned.
pub trait Listener<F>: Send + Sync {
    fn accept(&self, frame: &F);

    /// Final event of a stream closed by its producer. Called at most once and
    /// never followed by `accept`.
    fn on_close(&self) {}
}

impl<F, T> Listener<F> for T
where
    T: Fn(&F) + Send + Sync,
{
    fn accept(&self, frame: &F) {
        self(frame)
    }
}

/// Lifecycle of a stream. Either side may close first; the stream is dead once
/// both have.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open = 0,
    ClosedByConsumer = 1,
    ClosedByProducer = 2,
    Dead = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Open,
            1 => StreamState::ClosedByConsumer,
            2 => StreamState::ClosedByProducer,
            _ => StreamState::Dead,
        }
    }
}

/// Set next to the state once the producer closed an open stream. Whoever
/// detaches the listener then owes it the `on_close` sentinel.
const PRODUCER_FIRST: u8 = 0x80;

type CloseHook = Box<dyn FnOnce(u64) + Send>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One producer to one listener pipe.
///
/// A single mutex guards the listener slot; `update` holds it for the duration
/// of `accept`, which is what serializes delivery against `stop_listening` and
/// `close`.
pub struct Stream<F: 'static> {
    id: u64,
    sense: &'static str,
    internal: bool,
    state: AtomicU8,
    sentinel_sent: AtomicBool,
    slot: Mutex<Option<Arc<dyn Listener<F>>>>,
    delivering: Mutex<Option<ThreadId>>,
    on_consumer_close: Mutex<Option<CloseHook>>,
}

impl<F: 'static> Stream<F> {
    fn new(id: u64, sense: &'static str, listener: Arc<dyn Listener<F>>, internal: bool) -> Self {
        Self {
            id,
            sense,
            internal,
            state: AtomicU8::new(StreamState::Open as u8),
            sentinel_sent: AtomicBool::new(false),
            slot: Mutex::new(Some(listener)),
            delivering: Mutex::new(None),
            on_consumer_close: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst) & !PRODUCER_FIRST)
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Hand `frame` to the listener and wait for `accept` to return.
    ///
    /// Returns `false` without calling the listener once either side closed.
    pub fn update(&self, frame: &F) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut slot = lock(&self.slot);
        if !self.is_open() {
            return false;
        }
        let listener = match slot.as_ref() {
            Some(l) => l.clone(),
            None => return false,
        };

        *lock(&self.delivering) = Some(thread::current().id());
        listener.accept(frame);
        *lock(&self.delivering) = None;

        // Closed while the listener ran; finish the detach here.
        let state = self.state();
        if state != StreamState::Open {
            let listener = slot.take();
            drop(slot);
            self.finish_detach(listener);
            if matches!(state, StreamState::ClosedByConsumer | StreamState::Dead) {
                self.run_consumer_hook();
            }
        }
        true
    }

    /// Consumer side: detach the listener. A frame already being delivered
    /// completes first, unless this is called from inside that `accept`.
    pub fn stop_listening(&self) {
        if self.transition(true).is_none() {
            return;
        }
        log::debug!("{} stream {}: listener detached", self.sense, self.id);
        if self.in_accept_on_this_thread() {
            return;
        }
        let listener = lock(&self.slot).take();
        self.finish_detach(listener);
        self.run_consumer_hook();
    }

    /// Producer side: mark the stream dead. Later `update` calls are no-ops and
    /// the listener receives its `on_close` sentinel.
    pub fn close(&self) {
        if self.transition(false).is_none() {
            return;
        }
        log::debug!("{} stream {}: closed by producer", self.sense, self.id);
        if self.in_accept_on_this_thread() {
            return;
        }
        let listener = lock(&self.slot).take();
        self.finish_detach(listener);
    }

    /// Send the close sentinel to a just-detached listener if the producer
    /// closed the stream while it was still open.
    fn finish_detach(&self, listener: Option<Arc<dyn Listener<F>>>) {
        let listener = match listener {
            Some(l) => l,
            None => return,
        };
        let producer_first = self.state.load(Ordering::SeqCst) & PRODUCER_FIRST != 0;
        if producer_first && !self.sentinel_sent.swap(true, Ordering::SeqCst) {
            listener.on_close();
        }
    }

    fn transition(&self, by_consumer: bool) -> Option<StreamState> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let flags = current & PRODUCER_FIRST;
            let from = StreamState::from_u8(current & !PRODUCER_FIRST);
            let to = match (from, by_consumer) {
                (StreamState::Open, true) => StreamState::ClosedByConsumer,
                (StreamState::Open, false) => StreamState::ClosedByProducer,
                (StreamState::ClosedByProducer, true) => StreamState::Dead,
                (StreamState::ClosedByConsumer, false) => StreamState::Dead,
                _ => return None,
            };
            let next = if from == StreamState::Open && !by_consumer {
                to as u8 | PRODUCER_FIRST
            } else {
                to as u8 | flags
            };
            match self.state.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(from),
                Err(actual) => current = actual,
            }
        }
    }

    fn in_accept_on_this_thread(&self) -> bool {
        *lock(&self.delivering) == Some(thread::current().id())
    }

    fn set_consumer_hook(&self, hook: CloseHook) {
        *lock(&self.on_consumer_close) = Some(hook);
    }

    fn run_consumer_hook(&self) {
        let hook = lock(&self.on_consumer_close).take();
        if let Some(hook) = hook {
            hook(self.id);
        }
    }
}

/// Application-held end of a stream. Dropping it stops listening.
pub struct StreamHandle<F: 'static> {
    stream: Arc<Stream<F>>,
}

impl<F: 'static> StreamHandle<F> {
    pub fn stream(&self) -> &Arc<Stream<F>> {
        &self.stream
    }
}

impl<F: 'static> Deref for StreamHandle<F> {
    type Target = Stream<F>;
    fn deref(&self) -> &Stream<F> {
        &self.stream
    }
}

impl<F: 'static> Drop for StreamHandle<F> {
    fn drop(&mut self) {
        self.stream.stop_listening();
    }
}

/// The streams a sense publishes one frame kind on.
pub struct StreamSet<F: 'static> {
    sense: &'static str,
    next_id: AtomicU64,
    inner: Arc<Mutex<SetInner<F>>>,
}

struct SetInner<F: 'static> {
    streams: Vec<Arc<Stream<F>>>,
    sealed: bool,
}

impl<F: 'static> StreamSet<F> {
    pub fn new(sense: &'static str) -> Self {
        Self {
            sense,
            next_id: AtomicU64::new(0),
            inner: Arc::new(Mutex::new(SetInner {
                streams: Vec::new(),
                sealed: false,
            })),
        }
    }

    /// Open a stream to `listener`. Fails once the set has been sealed.
    pub fn open(&self, listener: Arc<dyn Listener<F>>) -> Result<StreamHandle<F>> {
        self.open_with(listener, false)
    }

    /// Stream held by another sense of the same context rather than the
    /// application. Not counted by [`StreamSet::external_count`].
    pub(crate) fn open_internal(&self, listener: Arc<dyn Listener<F>>) -> Result<StreamHandle<F>> {
        self.open_with(listener, true)
    }

    fn open_with(&self, listener: Arc<dyn Listener<F>>, internal: bool) -> Result<StreamHandle<F>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(Stream::new(id, self.sense, listener, internal));

        // The sense forgets the stream once its consumer lets go.
        let weak = Arc::downgrade(&self.inner);
        stream.set_consumer_hook(Box::new(move |id| {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).streams.retain(|s| s.id != id);
            }
        }));

        let mut inner = lock(&self.inner);
        if inner.sealed {
            return Err(SrError::ContextInvalid);
        }
        inner.streams.push(stream.clone());
        drop(inner);

        log::debug!("{} stream {} opened", self.sense, id);
        Ok(StreamHandle { stream })
    }

    /// Deliver `frame` to every open stream, in opening order. Returns how many
    /// listeners accepted it.
    pub fn publish(&self, frame: &F) -> usize {
        // Snapshot so listeners may open or close streams from `accept`.
        let streams = lock(&self.inner).streams.clone();
        streams.iter().filter(|s| s.update(frame)).count()
    }

    /// Producer-close every stream. With `seal`, later opens fail.
    pub fn close_all(&self, seal: bool) {
        let streams = {
            let mut inner = lock(&self.inner);
            inner.sealed |= seal;
            std::mem::take(&mut inner.streams)
        };
        for stream in streams {
            stream.close();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams the application still listens on.
    pub fn external_count(&self) -> usize {
        lock(&self.inner)
            .streams
            .iter()
            .filter(|s| !s.internal && s.is_open())
            .count()
    }
}
