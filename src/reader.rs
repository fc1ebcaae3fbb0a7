//! The read pipeline: ciphertext in, plaintext out.
//!
//! Incoming record bytes are accumulated into the read buffer and fed
//! through the engine's `unwrap` until the buffer runs dry. Decrypted
//! output goes downstream; handshake steps observed along the way are
//! handed to the coordinator. Upstream credit is withheld once the
//! buffered ciphertext passes the configured target, so a stalled
//! downstream stops the inflow instead of growing the buffer forever.

use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::duplex::Core;
use crate::engine::{EngineRun, EngineStatus};
use crate::flow::{base_window_update, HalfOwner, SubscriberHalf, UpstreamSubscription};
use crate::handshake::Caller;
use crate::record_buffer::RecordBuffer;
use crate::scheduler::{SchedulingAction, SequentialScheduler};

type SchedulingHook = Box<dyn Fn() -> SchedulingAction + Send + Sync>;

/// The upstream-facing endpoint of the decrypting direction.
pub struct Reader {
    core: Arc<Core>,
    half: Arc<SubscriberHalf>,
    scheduler: SequentialScheduler,
    read_buf: Mutex<RecordBuffer>,
    completing: AtomicBool,
    /// Plaintext bytes delivered downstream so far.
    delivered: AtomicU64,
    scheduling_hook: Mutex<Option<SchedulingHook>>,
}

impl Reader {
    pub(crate) fn new(core: Arc<Core>, half: Arc<SubscriberHalf>) -> Arc<Self> {
        let read_buf = RecordBuffer::new(
            core.config.initial_read_capacity,
            core.config.max_read_buffer,
        );
        let reader = Arc::new(Self {
            core,
            half,
            scheduler: SequentialScheduler::new(),
            read_buf: Mutex::new(read_buf),
            completing: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            scheduling_hook: Mutex::new(None),
        });
        let owner: Arc<dyn HalfOwner> = reader.clone();
        let weak: Weak<dyn HalfOwner> = Arc::downgrade(&owner);
        reader.half.set_owner(weak);
        reader
    }

    /// Attach the transport delivering ciphertext to this pipeline.
    pub fn subscribe_upstream(&self, subscription: Arc<dyn UpstreamSubscription>) {
        self.half.set_upstream(subscription);
    }

    /// Entry point for ciphertext buffers delivered from upstream. Never
    /// blocks; processing happens on the serialized work function.
    pub fn incoming(&self, buffers: Vec<Bytes>, complete: bool) {
        if log::log_enabled!(log::Level::Debug) {
            let total: usize = buffers.iter().map(Bytes::len).sum();
            debug!("tls reader: adding {total} bytes to read buffer");
        }
        let appended = {
            let mut buf = self.read_buf.lock();
            let mut result = Ok(());
            for bytes in &buffers {
                if let Err(err) = buf.append(bytes) {
                    result = Err(err);
                    break;
                }
            }
            if complete {
                self.completing.store(true, Ordering::SeqCst);
            }
            result
        };
        if let Err(err) = appended {
            self.core.handle_error(err);
            return;
        }
        self.half.on_incoming_frame();
        self.schedule();
    }

    /// Upstream failed; tear the whole pump down.
    pub fn upstream_error(&self, error: io::Error) {
        self.core.handle_error(error);
    }

    /// Install a hook consulted before each run of the work function.
    /// Without one, runs always proceed.
    pub fn set_scheduling_hook(
        &self,
        hook: impl Fn() -> SchedulingAction + Send + Sync + 'static,
    ) {
        *self.scheduling_hook.lock() = Some(Box::new(hook));
    }

    fn enter_scheduling(&self) -> SchedulingAction {
        match &*self.scheduling_hook.lock() {
            Some(hook) => hook(),
            None => SchedulingAction::Continue,
        }
    }

    pub(crate) fn schedule(&self) {
        self.scheduler
            .run_with_hook(|| self.enter_scheduling(), || self.process_data());
    }

    pub(crate) fn stop(&self) {
        debug!("tls reader: stop");
        self.scheduler.stop();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    pub(crate) fn half(&self) -> &SubscriberHalf {
        &self.half
    }

    pub(crate) fn buffered(&self) -> usize {
        self.read_buf.lock().len()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    // Work function, serialized by the scheduler.
    fn process_data(&self) {
        if let Err(err) = self.try_process() {
            self.core.handle_error(err);
        }
    }

    fn try_process(&self) -> io::Result<()> {
        debug!(
            "tls reader: process, buffered: {}, state: {}",
            self.buffered(),
            self.core.hs_state.describe()
        );
        let mut complete = false;
        loop {
            let len = self.read_buf.lock().len();
            if len == 0 {
                break;
            }

            let run = {
                let mut buf = self.read_buf.lock();
                complete = self.completing.load(Ordering::SeqCst);
                self.unwrap_record(&mut buf)?
            };

            if run.outcome.produced > 0 {
                debug!("tls reader: sending {} bytes", run.outcome.produced);
                self.delivered
                    .fetch_add(run.outcome.produced as u64, Ordering::SeqCst);
                if let Some(dest) = run.dest.clone() {
                    self.half.outgoing(vec![dest], false)?;
                }
            }

            if run.outcome.status == EngineStatus::BufferUnderflow {
                debug!("tls reader: buffer underflow");
                // Not enough data for a full record.
                self.half.request_more();
                let buf = self.read_buf.lock();
                if buf.len() > len {
                    // More arrived while we were emitting; keep going.
                    continue;
                }
                return Ok(());
            }

            if complete && run.outcome.status == EngineStatus::Closed {
                debug!("tls reader: closed, completing");
                self.half.outgoing(Vec::new(), true)?;
                return Ok(());
            }

            let mut handshaking = false;
            if run.handshaking() && !complete {
                debug!("tls reader: handshaking");
                if self.core.do_handshake(&run.outcome, Caller::Reader)? {
                    self.core.resume_activity();
                }
                handshaking = true;
            } else if self.core.hs_state.clear_handshaking() {
                self.core.set_alpn();
                handshaking = false;
                self.core.resume_activity();
            }

            if handshaking && !complete {
                // Wait for the other side or the executor to make
                // progress; they reschedule us.
                return Ok(());
            }
        }

        if !complete {
            let buf = self.read_buf.lock();
            complete = self.completing.load(Ordering::SeqCst) && buf.is_empty();
        }
        if complete {
            debug!("tls reader: completing");
            // No more activity after this point; resolve ALPN with
            // whatever the engine has, even if the handshake never ran.
            self.core.set_alpn();
            self.half.outgoing(Vec::new(), true)?;
        }
        Ok(())
    }

    /// Run one `unwrap`, growing the destination on overflow. Called with
    /// the read buffer lock held.
    fn unwrap_record(&self, buf: &mut RecordBuffer) -> io::Result<EngineRun> {
        let engine = &self.core.engine;
        let mut dst = BytesMut::with_capacity(engine.application_buffer_size());
        loop {
            let outcome = engine.unwrap(buf, &mut dst)?;
            match outcome.status {
                EngineStatus::BufferOverflow => {
                    // Destination too small (the app buffer size may have
                    // changed); grow, keep produced bytes, retry.
                    let mut bigger =
                        BytesMut::with_capacity(engine.application_buffer_size() + dst.len());
                    bigger.extend_from_slice(&dst);
                    dst = bigger;
                }
                EngineStatus::Closed => {
                    let run = if outcome.produced > 0 {
                        EngineRun::with_dest(outcome, dst.freeze())
                    } else {
                        EngineRun::new(outcome)
                    };
                    self.core.do_closure(&run.outcome)?;
                    return Ok(run);
                }
                EngineStatus::BufferUnderflow => return Ok(EngineRun::new(outcome)),
                EngineStatus::Ok => return Ok(EngineRun::with_dest(outcome, dst.freeze())),
            }
        }
    }
}

impl HalfOwner for Reader {
    fn wake(&self) {
        self.schedule();
    }

    fn terminal_delivered(&self) {
        self.core.half_completed(Caller::Reader);
    }

    fn fatal(&self, err: io::Error) {
        self.core.handle_error(err);
    }

    fn upstream_window_update(&self, current_window: u64, downstream_queue: usize) -> u64 {
        if self.read_buf.lock().len() > self.core.config.target_read_buffer {
            0
        } else {
            base_window_update(current_window, downstream_queue)
        }
    }
}
