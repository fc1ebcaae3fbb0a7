//! The write pipeline: plaintext in, ciphertext out.
//!
//! Plaintext buffers queue up until the serialized work function feeds
//! them through the engine's `wrap` and pushes the resulting records
//! downstream. The queue also carries two tagged markers: a handshake
//! trigger, which forces a `wrap` call that carries no application bytes
//! (how the reader and the coordinator make this side produce handshake
//! records), and a completion marker for application end-of-stream.

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::duplex::Core;
use crate::engine::{EngineRun, EngineStatus, HandshakeStatus};
use crate::flow::{base_window_update, HalfOwner, SubscriberHalf, UpstreamSubscription};
use crate::handshake::Caller;
use crate::scheduler::SequentialScheduler;

/// One entry of the write queue. The markers are distinct variants, so a
/// zero-length application buffer can never be mistaken for either.
enum WriteItem {
    Data(Bytes),
    /// Schedule a `wrap` that carries no application bytes; consumed by
    /// queue cleanup after the wrap ran.
    HandshakeTrigger,
    /// Application end-of-stream; survives cleanup until the final empty
    /// frame has been emitted.
    Completion,
}

#[derive(Default)]
struct WriteQueue {
    items: VecDeque<WriteItem>,
}

impl WriteQueue {
    fn remaining_bytes(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                WriteItem::Data(bytes) => bytes.len(),
                _ => 0,
            })
            .sum()
    }

    fn has_trigger(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, WriteItem::HandshakeTrigger))
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push_data(&mut self, bytes: Bytes) {
        self.items.push_back(WriteItem::Data(bytes));
    }

    fn push_trigger(&mut self) {
        self.items.push_back(WriteItem::HandshakeTrigger);
    }

    fn push_completion(&mut self) {
        self.items.push_back(WriteItem::Completion);
    }

    /// The data payloads in queue order, as cheap clones. The engine
    /// consumes from these; consumption is applied back to the queue by
    /// [`consume_and_clean`](Self::consume_and_clean).
    fn snapshot(&self) -> Vec<Bytes> {
        self.items
            .iter()
            .filter_map(|item| match item {
                WriteItem::Data(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drop `consumed` bytes from the front of the queue and tidy it up:
    /// drained data buffers and handshake triggers go away, the
    /// completion marker stays.
    fn consume_and_clean(&mut self, mut consumed: usize) {
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            match item {
                WriteItem::Data(mut bytes) => {
                    if consumed > 0 {
                        let n = consumed.min(bytes.len());
                        bytes.advance(n);
                        consumed -= n;
                    }
                    if !bytes.is_empty() {
                        kept.push_back(WriteItem::Data(bytes));
                    }
                }
                WriteItem::HandshakeTrigger => {}
                WriteItem::Completion => kept.push_back(WriteItem::Completion),
            }
        }
        self.items = kept;
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// The upstream-facing endpoint of the encrypting direction.
pub struct Writer {
    core: Arc<Core>,
    half: Arc<SubscriberHalf>,
    scheduler: SequentialScheduler,
    queue: Mutex<WriteQueue>,
    completing: AtomicBool,
    completed: AtomicBool,
}

impl Writer {
    pub(crate) fn new(core: Arc<Core>, half: Arc<SubscriberHalf>) -> Arc<Self> {
        let writer = Arc::new(Self {
            core,
            half,
            scheduler: SequentialScheduler::new(),
            queue: Mutex::new(WriteQueue::default()),
            completing: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        });
        let owner: Arc<dyn HalfOwner> = writer.clone();
        let weak: Weak<dyn HalfOwner> = Arc::downgrade(&owner);
        writer.half.set_owner(weak);
        writer
    }

    /// Attach the transport delivering plaintext to this pipeline. This
    /// also seeds the first handshake trigger, so the engine starts
    /// handshaking before any application bytes exist.
    pub fn subscribe_upstream(&self, subscription: Arc<dyn UpstreamSubscription>) {
        self.half.set_upstream(subscription);
        debug!("tls writer: subscribed, initiating handshake");
        self.push_trigger();
        self.schedule();
    }

    /// Entry point for plaintext buffers delivered from upstream.
    /// Completion arrives as `complete = true` with no buffers.
    pub fn incoming(&self, buffers: Vec<Bytes>, complete: bool) {
        debug_assert!(
            !complete || buffers.is_empty(),
            "completion must not carry buffers"
        );
        {
            let mut queue = self.queue.lock();
            if complete {
                debug!("tls writer: adding completion marker");
                self.completing.store(true, Ordering::SeqCst);
                queue.push_completion();
            } else {
                debug!("tls writer: adding {} buffers to the write queue", buffers.len());
                for bytes in buffers {
                    queue.push_data(bytes);
                }
            }
        }
        self.half.on_incoming_frame();
        self.schedule();
    }

    /// Upstream failed; tear the whole pump down.
    pub fn upstream_error(&self, error: io::Error) {
        self.core.handle_error(error);
    }

    /// Whether the peer has announced it will send nothing further, so
    /// writes are no longer meaningful.
    pub fn closing(&self) -> bool {
        self.core.close_notify_received()
    }

    /// Enqueue a handshake trigger. The coordinator's injection point.
    pub(crate) fn push_trigger(&self) {
        self.queue.lock().push_trigger();
    }

    pub(crate) fn schedule(&self) {
        self.scheduler.run_or_schedule(|| self.process_data());
    }

    pub(crate) fn stop(&self) {
        debug!("tls writer: stop");
        self.scheduler.stop();
    }

    pub(crate) fn half(&self) -> &SubscriberHalf {
        &self.half
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn need_wrap(&self) -> bool {
        self.core.engine.handshake_status() == HandshakeStatus::NeedWrap
    }

    // Work function, serialized by the scheduler.
    fn process_data(&self) {
        if let Err(err) = self.try_process() {
            self.core.handle_error(err);
        }
    }

    fn try_process(&self) -> io::Result<()> {
        let mut completing = self.completing.load(Ordering::SeqCst);
        let (queued_bytes, has_trigger) = {
            let queue = self.queue.lock();
            (queue.remaining_bytes(), queue.has_trigger())
        };
        debug!(
            "tls writer: process, queued: {} bytes, trigger: {}, need_wrap: {}",
            queued_bytes,
            has_trigger,
            self.need_wrap()
        );

        loop {
            {
                let queue = self.queue.lock();
                if queue.remaining_bytes() == 0 && !queue.has_trigger() && !self.need_wrap() {
                    break;
                }
            }

            let mut src = self.queue.lock().snapshot();
            let run = self.wrap_buffers(&mut src)?;

            if run.outcome.status == EngineStatus::Closed {
                // No further plaintext is wanted from upstream.
                self.half.cancel_upstream();
                if run.outcome.produced == 0 {
                    return Ok(());
                }
                if !completing && !self.completed.load(Ordering::SeqCst) {
                    completing = true;
                    self.completing.store(true, Ordering::SeqCst);
                    // Flush whatever the engine still produced.
                    self.queue.lock().push_completion();
                }
            }

            let mut handshaking = false;
            if run.handshaking() {
                debug!("tls writer: handshaking");
                // The return value only matters for the reader; our own
                // loop keeps wrapping as long as the engine asks.
                let _ = self.core.do_handshake(&run.outcome, Caller::Writer)?;
                handshaking = true;
            } else if self.core.hs_state.clear_handshaking() {
                self.core.set_alpn();
                self.core.resume_activity();
            }

            self.queue.lock().consume_and_clean(run.outcome.consumed);

            if let Some(dest) = run.dest {
                if !dest.is_empty() {
                    debug!("tls writer: sending {} bytes downstream", dest.len());
                    self.half.outgoing(vec![dest], false)?;
                }
            }

            if handshaking && !completing {
                if self.need_wrap() {
                    continue;
                }
                // Wait for the peer's response through the reader.
                return Ok(());
            }
        }

        if completing && self.queue.lock().remaining_bytes() == 0 {
            if !self.completed.swap(true, Ordering::SeqCst) {
                debug!("tls writer: completing");
                self.queue.lock().clear();
                self.half.outgoing(Vec::new(), true)?;
            }
            return Ok(());
        }

        if self.queue.lock().is_empty() && self.need_wrap() {
            // Guarantee re-entry: the trigger keeps the loop condition
            // true for the next scheduled run.
            self.push_trigger();
            self.schedule();
        }
        Ok(())
    }

    /// Run one `wrap` over the queue snapshot, growing the destination
    /// on overflow.
    fn wrap_buffers(&self, src: &mut Vec<Bytes>) -> io::Result<EngineRun> {
        let engine = &self.core.engine;
        if log::log_enabled!(log::Level::Debug) {
            let total: usize = src.iter().map(Bytes::len).sum();
            debug!("tls writer: wrapping {total} bytes");
        }
        let mut dst = BytesMut::with_capacity(engine.packet_buffer_size());
        loop {
            let outcome = engine.wrap(src.as_mut_slice(), &mut dst)?;
            match outcome.status {
                EngineStatus::BufferOverflow => {
                    // Not expected with a packet-sized buffer, but the
                    // engine is allowed to ask for more room.
                    debug!("tls writer: buffer overflow");
                    let mut bigger =
                        BytesMut::with_capacity(engine.application_buffer_size() + dst.len());
                    bigger.extend_from_slice(&dst);
                    dst = bigger;
                }
                // Closed may still carry final record bytes; the caller
                // deals with the status.
                EngineStatus::Closed | EngineStatus::Ok => {
                    return Ok(EngineRun::with_dest(outcome, dst.freeze()));
                }
                EngineStatus::BufferUnderflow => {
                    debug!("tls writer: unexpected underflow");
                    return Ok(EngineRun::new(outcome));
                }
            }
        }
    }
}

impl HalfOwner for Writer {
    fn wake(&self) {
        self.schedule();
    }

    fn terminal_delivered(&self) {
        self.core.half_completed(Caller::Writer);
    }

    fn fatal(&self, err: io::Error) {
        self.core.handle_error(err);
    }

    fn upstream_window_update(&self, current_window: u64, downstream_queue: usize) -> u64 {
        if self.queue.lock().len() > self.core.config.max_write_queue {
            0
        } else {
            base_window_update(current_window, downstream_queue)
        }
    }
}
