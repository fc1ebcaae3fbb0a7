//! Demand-based endpoint shim shared by both pipelines.
//!
//! Each pipeline owns one [`SubscriberHalf`]: it accounts for upstream
//! credit (how many frames the transport may still deliver to us) and
//! buffers outbound frames until the downstream sink has signaled demand
//! for them. A frame is one `Vec<Bytes>`; demand is counted in frames,
//! not bytes.
//!
//! Terminal signals are exactly-once: whichever of completion or error
//! reaches the sink first wins, and everything after it is dropped.

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A downstream consumer of frames.
///
/// `on_subscribe` is called once, during pump construction, handing the
/// sink the [`Demand`] handle it uses to request frames. The pump then
/// delivers at most the outstanding requested demand via `on_next`,
/// followed by exactly one terminal signal.
pub trait FrameSink: Send + Sync {
    fn on_subscribe(&self, demand: Demand);

    /// Deliver one frame. An error return is fatal to the whole pump.
    fn on_next(&self, frames: Vec<Bytes>) -> io::Result<()>;

    fn on_complete(&self);

    fn on_error(&self, error: &io::Error);
}

/// Credit interface of an upstream transport feeding a pipeline.
pub trait UpstreamSubscription: Send + Sync {
    /// Allow `n` more frames to be delivered via `incoming`.
    fn request(&self, n: u64);

    /// No further frames are wanted.
    fn cancel(&self);
}

/// Handle given to a [`FrameSink`] for signaling demand.
#[derive(Clone)]
pub struct Demand {
    half: Weak<SubscriberHalf>,
}

impl Demand {
    /// Request `n` more frames. Queued frames are delivered immediately
    /// on the calling thread; the pipeline is then rescheduled in case it
    /// was waiting to produce more.
    pub fn request(&self, n: u64) {
        let Some(half) = self.half.upgrade() else {
            return;
        };
        half.demand.fetch_add(n, Ordering::SeqCst);
        if let Err(err) = half.drain() {
            if let Some(owner) = half.owner() {
                owner.fatal(err);
            }
            return;
        }
        if let Some(owner) = half.owner() {
            owner.wake();
        }
    }
}

/// Pipeline-side hooks the shim calls back into.
pub(crate) trait HalfOwner: Send + Sync {
    /// Re-run the pipeline's work function.
    fn wake(&self);

    /// The terminal completion signal reached the sink.
    fn terminal_delivered(&self);

    /// A downstream delivery failed outside the pipeline's own run.
    fn fatal(&self, err: io::Error);

    /// How much upstream credit to grant, given the current window and
    /// the number of undelivered downstream frames.
    fn upstream_window_update(&self, current_window: u64, downstream_queue: usize) -> u64;
}

/// Default credit formula: one frame at a time, and only while the
/// downstream side is keeping up.
pub(crate) fn base_window_update(current_window: u64, downstream_queue: usize) -> u64 {
    if downstream_queue > 2 {
        0
    } else if current_window == 0 {
        1
    } else {
        0
    }
}

struct OutFrame {
    frames: Vec<Bytes>,
    complete: bool,
}

/// The per-pipeline endpoint state: downstream sink + demand + pending
/// frames, and the upstream subscription + credit window.
pub(crate) struct SubscriberHalf {
    label: &'static str,
    sink: Box<dyn FrameSink>,
    demand: AtomicU64,
    output: Mutex<VecDeque<OutFrame>>,
    /// Single-drainer guard so deliveries never interleave.
    draining: AtomicBool,
    terminal_sent: AtomicBool,
    upstream: Mutex<Option<Arc<dyn UpstreamSubscription>>>,
    upstream_window: AtomicU64,
    upstream_completed: AtomicBool,
    owner: OnceLock<Weak<dyn HalfOwner>>,
}

impl SubscriberHalf {
    pub(crate) fn new(label: &'static str, sink: Box<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            label,
            sink,
            demand: AtomicU64::new(0),
            output: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            upstream: Mutex::new(None),
            upstream_window: AtomicU64::new(0),
            upstream_completed: AtomicBool::new(false),
            owner: OnceLock::new(),
        })
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn HalfOwner>) {
        let _ = self.owner.set(owner);
    }

    fn owner(&self) -> Option<Arc<dyn HalfOwner>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Hand the sink its demand handle. Called once, at construction.
    pub(crate) fn subscribe_sink(self: &Arc<Self>) {
        self.sink.on_subscribe(Demand {
            half: Arc::downgrade(self),
        });
    }

    // ---- downstream side ----

    /// Queue a frame for downstream delivery and deliver as far as
    /// demand allows. `complete` marks the terminal frame.
    pub(crate) fn outgoing(&self, frames: Vec<Bytes>, complete: bool) -> io::Result<()> {
        if self.terminal_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.output.lock().push_back(OutFrame { frames, complete });
        self.drain()
    }

    /// Deliver queued frames while demand lasts. Safe to call from any
    /// thread; concurrent callers collapse onto a single drainer.
    fn drain(&self) -> io::Result<()> {
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                // The active drainer re-checks after releasing, so this
                // frame is not lost.
                return Ok(());
            }
            let result = self.deliver_pending();
            self.draining.store(false, Ordering::SeqCst);
            result?;

            let more = {
                let q = self.output.lock();
                match q.front() {
                    None => false,
                    Some(f) => f.complete || self.demand.load(Ordering::SeqCst) > 0,
                }
            };
            if !more {
                self.maybe_update_window();
                return Ok(());
            }
        }
    }

    fn deliver_pending(&self) -> io::Result<()> {
        loop {
            let frame = {
                let mut q = self.output.lock();
                let Some(front) = q.front() else {
                    return Ok(());
                };
                // Terminal frames ride for free; data frames consume one
                // demand unit each.
                if !front.complete && !self.try_take_demand() {
                    return Ok(());
                }
                match q.pop_front() {
                    Some(frame) => frame,
                    None => return Ok(()),
                }
            };

            if frame.complete {
                if !frame.frames.is_empty() {
                    self.sink.on_next(frame.frames)?;
                }
                if !self.terminal_sent.swap(true, Ordering::SeqCst) {
                    debug!("tls {}: downstream complete", self.label);
                    self.sink.on_complete();
                    if let Some(owner) = self.owner() {
                        owner.terminal_delivered();
                    }
                }
                self.output.lock().clear();
                return Ok(());
            }
            self.sink.on_next(frame.frames)?;
        }
    }

    fn try_take_demand(&self) -> bool {
        self.demand
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok()
    }

    /// Deliver the terminal error, if no terminal was sent yet.
    pub(crate) fn deliver_error(&self, error: &io::Error) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            debug!("tls {}: downstream error: {}", self.label, error);
            self.output.lock().clear();
            self.sink.on_error(error);
        }
    }

    pub(crate) fn downstream_queue_len(&self) -> usize {
        self.output.lock().len()
    }

    pub(crate) fn reset_demand(&self) {
        self.demand.store(0, Ordering::SeqCst);
    }

    // ---- upstream side ----

    /// Attach the upstream transport's credit interface and grant the
    /// initial window.
    pub(crate) fn set_upstream(&self, subscription: Arc<dyn UpstreamSubscription>) {
        *self.upstream.lock() = Some(subscription);
        self.maybe_update_window();
    }

    fn upstream(&self) -> Option<Arc<dyn UpstreamSubscription>> {
        self.upstream.lock().clone()
    }

    /// Account for one frame delivered by upstream, then recompute the
    /// credit window.
    pub(crate) fn on_incoming_frame(&self) {
        let _ = self
            .upstream_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| w.checked_sub(1));
        self.maybe_update_window();
    }

    fn maybe_update_window(&self) {
        if self.upstream_completed.load(Ordering::SeqCst) {
            return;
        }
        let Some(owner) = self.owner() else {
            return;
        };
        let Some(subscription) = self.upstream() else {
            return;
        };
        let current = self.upstream_window.load(Ordering::SeqCst);
        let grant = owner.upstream_window_update(current, self.downstream_queue_len());
        if grant > 0 {
            self.upstream_window.fetch_add(grant, Ordering::SeqCst);
            debug!("tls {}: requesting {} more upstream", self.label, grant);
            subscription.request(grant);
        }
    }

    /// Ask for one more upstream frame right now, bypassing the formula.
    /// Used when the engine underflowed and cannot proceed without more
    /// bytes.
    pub(crate) fn request_more(&self) {
        if self.upstream_completed.load(Ordering::SeqCst) {
            return;
        }
        let granted = self
            .upstream_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w == 0 {
                    Some(1)
                } else {
                    None
                }
            })
            .is_ok();
        if granted {
            if let Some(subscription) = self.upstream() {
                subscription.request(1);
            }
        }
    }

    /// Cancel the upstream subscription. Idempotent.
    pub(crate) fn cancel_upstream(&self) {
        if !self.upstream_completed.swap(true, Ordering::SeqCst) {
            if let Some(subscription) = self.upstream() {
                debug!("tls {}: cancelling upstream", self.label);
                subscription.cancel();
            }
        }
    }

    pub(crate) fn upstream_completed(&self) -> bool {
        self.upstream_completed.load(Ordering::SeqCst)
    }
}
