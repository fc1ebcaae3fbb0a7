//! Shared stubs for exercising the pump without a real TLS stack.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::engine::{DelegatedTask, EngineOutcome, EngineStatus, HandshakeStatus, TlsEngine};
use crate::executor::{Job, TaskExecutor};
use crate::flow::{Demand, FrameSink, UpstreamSubscription};
use crate::reader::Reader;

// ---- sinks ----

/// A downstream sink recording everything it receives.
pub(crate) struct RecordingSink {
    pub(crate) frames: Mutex<Vec<Vec<Bytes>>>,
    pub(crate) completions: AtomicUsize,
    pub(crate) errors: AtomicUsize,
    pub(crate) last_error: Mutex<Option<String>>,
    demand: Mutex<Option<Demand>>,
    initial_demand: u64,
}

impl RecordingSink {
    /// A sink with effectively unlimited demand.
    pub(crate) fn unlimited() -> Arc<Self> {
        Self::with_initial_demand(u64::MAX / 2)
    }

    /// A sink granting nothing until the test calls `request`.
    pub(crate) fn manual() -> Arc<Self> {
        Self::with_initial_demand(0)
    }

    fn with_initial_demand(initial_demand: u64) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            demand: Mutex::new(None),
            initial_demand,
        })
    }

    pub(crate) fn request(&self, n: u64) {
        let demand = self.demand.lock().clone();
        if let Some(demand) = demand {
            demand.request(n);
        }
    }

    /// All received payload bytes, concatenated.
    pub(crate) fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in self.frames.lock().iter() {
            for bytes in frame {
                out.extend_from_slice(bytes);
            }
        }
        out
    }
}

impl FrameSink for Arc<RecordingSink> {
    fn on_subscribe(&self, demand: Demand) {
        if self.initial_demand > 0 {
            demand.request(self.initial_demand);
        }
        *self.demand.lock() = Some(demand);
    }

    fn on_next(&self, frames: Vec<Bytes>) -> io::Result<()> {
        self.frames.lock().push(frames);
        Ok(())
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &io::Error) {
        *self.last_error.lock() = Some(error.to_string());
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- upstream subscriptions ----

/// An upstream that only records the credit it is granted.
pub(crate) struct RecordingUpstream {
    pub(crate) requested: AtomicU64,
    pub(crate) cancelled: AtomicBool,
}

impl RecordingUpstream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        })
    }
}

impl UpstreamSubscription for Arc<RecordingUpstream> {
    fn request(&self, n: u64) {
        self.requested.fetch_add(n, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// An upstream that synchronously feeds queued ciphertext chunks into a
/// reader, one per credit unit, like a transport draining its socket.
pub(crate) struct FeedingUpstream {
    chunks: Mutex<VecDeque<Bytes>>,
    target: OnceLock<Arc<Reader>>,
    pub(crate) fed: AtomicUsize,
    pub(crate) max_buffered: AtomicUsize,
    cancelled: AtomicBool,
}

impl FeedingUpstream {
    pub(crate) fn new(chunks: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(chunks.into()),
            target: OnceLock::new(),
            fed: AtomicUsize::new(0),
            max_buffered: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    pub(crate) fn attach(&self, reader: Arc<Reader>) {
        let _ = self.target.set(reader);
    }

    pub(crate) fn remaining_chunks(&self) -> usize {
        self.chunks.lock().len()
    }
}

impl UpstreamSubscription for Arc<FeedingUpstream> {
    fn request(&self, n: u64) {
        let Some(reader) = self.target.get().cloned() else {
            return;
        };
        for _ in 0..n {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            let Some(chunk) = self.chunks.lock().pop_front() else {
                return;
            };
            self.fed.fetch_add(1, Ordering::SeqCst);
            // Sample the peak the pipeline is about to see, before its
            // work function gets a chance to consume it.
            self.max_buffered
                .fetch_max(reader.buffered() + chunk.len(), Ordering::SeqCst);
            reader.incoming(vec![chunk], false);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// ---- executors ----

/// Runs jobs immediately on the calling thread.
pub(crate) struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Queues jobs for the test to run explicitly.
pub(crate) struct DeferredExecutor {
    jobs: Mutex<Vec<Job>>,
}

impl DeferredExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub(crate) fn run_all(&self) {
        loop {
            let job = self.jobs.lock().pop();
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}

impl TaskExecutor for Arc<DeferredExecutor> {
    fn execute(&self, job: Job) {
        self.jobs.lock().push(job);
    }
}

/// Spawns one thread per job.
pub(crate) struct ThreadExecutor;

impl TaskExecutor for ThreadExecutor {
    fn execute(&self, job: Job) {
        std::thread::spawn(job);
    }
}

// ---- engines ----

const FRAME_HEADER: usize = 2;

struct FrameEngineState {
    inbound_done: bool,
    outbound_done: bool,
    /// close_notify seen inbound, acknowledgement not yet produced.
    pending_close_ack: bool,
}

/// A pass-through engine standing in for TLS: `wrap` prefixes payloads
/// with a 2-byte big-endian length, `unwrap` strips the prefix. A
/// zero-length frame plays the role of close_notify. No handshake.
///
/// When an incoming record is too big for the advertised application
/// buffer, the engine reports overflow and bumps the advertised size,
/// the way a renegotiated session does; the caller's grow-and-retry
/// logic then succeeds.
pub(crate) struct FrameEngine {
    state: Mutex<FrameEngineState>,
    alpn: String,
    packet_buffer: usize,
    app_buffer: AtomicUsize,
}

impl FrameEngine {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_alpn("")
    }

    pub(crate) fn with_alpn(alpn: &str) -> Arc<Self> {
        Self::with_buffer_sizes(16 * 1024 + FRAME_HEADER, 16 * 1024, alpn)
    }

    pub(crate) fn with_buffer_sizes(packet: usize, app: usize, alpn: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FrameEngineState {
                inbound_done: false,
                outbound_done: false,
                pending_close_ack: false,
            }),
            alpn: alpn.to_string(),
            packet_buffer: packet,
            app_buffer: AtomicUsize::new(app),
        })
    }

    /// Encode one frame the way this engine's `wrap` does; for building
    /// test ciphertext.
    pub(crate) fn encode(payload: &[u8]) -> Bytes {
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        Bytes::from(frame)
    }

    pub(crate) fn close_frame() -> Bytes {
        Bytes::from_static(&[0, 0])
    }
}

impl TlsEngine for FrameEngine {
    fn wrap(&self, src: &mut [Bytes], dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        let mut state = self.state.lock();
        if state.outbound_done {
            return Ok(EngineOutcome {
                status: EngineStatus::Closed,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }
        if state.pending_close_ack {
            // Answer the peer's close_notify.
            dst.extend_from_slice(&[0, 0]);
            state.pending_close_ack = false;
            state.outbound_done = true;
            return Ok(EngineOutcome {
                status: EngineStatus::Closed,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: FRAME_HEADER,
            });
        }

        let total: usize = src.iter().map(Bytes::len).sum();
        if total == 0 {
            return Ok(EngineOutcome {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }
        let take = total.min(u16::MAX as usize);
        let room = dst.capacity() - dst.len();
        if take + FRAME_HEADER > room {
            // Make sure the advertised session size covers the retry.
            self.app_buffer.fetch_max(take + FRAME_HEADER, Ordering::SeqCst);
            return Ok(EngineOutcome {
                status: EngineStatus::BufferOverflow,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }

        dst.extend_from_slice(&(take as u16).to_be_bytes());
        let mut left = take;
        for bytes in src.iter_mut() {
            if left == 0 {
                break;
            }
            let n = left.min(bytes.len());
            dst.extend_from_slice(&bytes[..n]);
            bytes.advance(n);
            left -= n;
        }
        Ok(EngineOutcome {
            status: EngineStatus::Ok,
            handshake: HandshakeStatus::NotHandshaking,
            consumed: take,
            produced: FRAME_HEADER + take,
        })
    }

    fn unwrap(&self, src: &mut dyn Buf, dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        let mut state = self.state.lock();
        let chunk = src.chunk();
        if chunk.len() < FRAME_HEADER {
            return Ok(EngineOutcome {
                status: EngineStatus::BufferUnderflow,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }
        let len = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
        if len == 0 {
            // close_notify
            state.inbound_done = true;
            state.pending_close_ack = true;
            src.advance(FRAME_HEADER);
            return Ok(EngineOutcome {
                status: EngineStatus::Closed,
                handshake: HandshakeStatus::NeedWrap,
                consumed: FRAME_HEADER,
                produced: 0,
            });
        }
        if chunk.len() < FRAME_HEADER + len {
            return Ok(EngineOutcome {
                status: EngineStatus::BufferUnderflow,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }
        let room = dst.capacity() - dst.len();
        if len > room {
            // Advertise a session buffer large enough for this record so
            // the caller's reallocation succeeds.
            self.app_buffer.fetch_max(len, Ordering::SeqCst);
            return Ok(EngineOutcome {
                status: EngineStatus::BufferOverflow,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            });
        }
        dst.extend_from_slice(&chunk[FRAME_HEADER..FRAME_HEADER + len]);
        src.advance(FRAME_HEADER + len);
        Ok(EngineOutcome {
            status: EngineStatus::Ok,
            handshake: HandshakeStatus::NotHandshaking,
            consumed: FRAME_HEADER + len,
            produced: len,
        })
    }

    fn next_delegated_task(&self) -> Option<DelegatedTask> {
        None
    }

    fn handshake_status(&self) -> HandshakeStatus {
        let state = self.state.lock();
        if state.pending_close_ack && !state.outbound_done {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn packet_buffer_size(&self) -> usize {
        self.packet_buffer
    }

    fn application_buffer_size(&self) -> usize {
        self.app_buffer.load(Ordering::SeqCst)
    }

    fn is_inbound_done(&self) -> bool {
        self.state.lock().inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.state.lock().outbound_done
    }

    fn application_protocol(&self) -> String {
        self.alpn.clone()
    }
}

// ---- scripted handshake engine ----

#[derive(Default)]
pub(crate) struct TaskConcurrency {
    pub(crate) current: AtomicUsize,
    pub(crate) max: AtomicUsize,
    pub(crate) runs: AtomicUsize,
}

enum HsPhase {
    /// Handing out delegated tasks, one at a time.
    Tasks { remaining: usize, outstanding: bool },
    NeedWrap,
    Done,
}

/// An engine whose handshake is a fixed script: `tasks` delegated tasks
/// (handed out one per drain), then one wrap that finishes the
/// handshake. Application data is consumed and discarded.
///
/// Like a real engine, it reports `NotHandshaking` until the first
/// `wrap`/`unwrap` touches it, so the script is driven by whichever
/// pipeline reaches it first.
pub(crate) struct ScriptEngine {
    phase: Arc<Mutex<HsPhase>>,
    started: AtomicBool,
    alpn: String,
    pub(crate) concurrency: Arc<TaskConcurrency>,
    task_work: std::time::Duration,
}

impl ScriptEngine {
    pub(crate) fn new(tasks: usize, alpn: &str) -> Arc<Self> {
        let phase = if tasks > 0 {
            HsPhase::Tasks {
                remaining: tasks,
                outstanding: false,
            }
        } else {
            HsPhase::NeedWrap
        };
        Arc::new(Self {
            phase: Arc::new(Mutex::new(phase)),
            started: AtomicBool::new(false),
            alpn: alpn.to_string(),
            concurrency: Arc::new(TaskConcurrency::default()),
            task_work: std::time::Duration::from_millis(1),
        })
    }
}

impl TlsEngine for ScriptEngine {
    fn wrap(&self, _src: &mut [Bytes], dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        self.started.store(true, Ordering::SeqCst);
        let mut phase = self.phase.lock();
        match &*phase {
            HsPhase::Tasks { .. } => Ok(EngineOutcome {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NeedTask,
                consumed: 0,
                produced: 0,
            }),
            HsPhase::NeedWrap => {
                dst.extend_from_slice(b"\x16HS");
                *phase = HsPhase::Done;
                Ok(EngineOutcome {
                    status: EngineStatus::Ok,
                    handshake: HandshakeStatus::Finished,
                    consumed: 0,
                    produced: 3,
                })
            }
            HsPhase::Done => Ok(EngineOutcome {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: 0,
                produced: 0,
            }),
        }
    }

    fn unwrap(&self, src: &mut dyn Buf, _dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        self.started.store(true, Ordering::SeqCst);
        let phase = self.phase.lock();
        let n = src.remaining();
        src.advance(n);
        let handshake = match &*phase {
            HsPhase::Tasks { .. } => HandshakeStatus::NeedTask,
            HsPhase::NeedWrap => HandshakeStatus::NeedWrap,
            HsPhase::Done => HandshakeStatus::NotHandshaking,
        };
        Ok(EngineOutcome {
            status: EngineStatus::Ok,
            handshake,
            consumed: n,
            produced: 0,
        })
    }

    fn next_delegated_task(&self) -> Option<DelegatedTask> {
        let mut phase = self.phase.lock();
        if let HsPhase::Tasks {
            remaining,
            outstanding,
        } = &mut *phase
        {
            if *remaining > 0 && !*outstanding {
                *outstanding = true;
                *remaining -= 1;
                let engine_phase = self.phase.clone();
                let concurrency = self.concurrency.clone();
                let work = self.task_work;
                return Some(Box::new(move || {
                    let running = concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
                    concurrency.max.fetch_max(running, Ordering::SeqCst);
                    concurrency.runs.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(work);
                    concurrency.current.fetch_sub(1, Ordering::SeqCst);

                    let mut phase = engine_phase.lock();
                    if let HsPhase::Tasks { outstanding, .. } = &mut *phase {
                        *outstanding = false;
                    }
                    if matches!(&*phase, HsPhase::Tasks { remaining: 0, .. }) {
                        *phase = HsPhase::NeedWrap;
                    }
                    Ok(())
                }));
            }
        }
        None
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.started.load(Ordering::SeqCst) {
            return HandshakeStatus::NotHandshaking;
        }
        match &*self.phase.lock() {
            HsPhase::Tasks { .. } => HandshakeStatus::NeedTask,
            HsPhase::NeedWrap => HandshakeStatus::NeedWrap,
            HsPhase::Done => HandshakeStatus::NotHandshaking,
        }
    }

    fn packet_buffer_size(&self) -> usize {
        1024
    }

    fn application_buffer_size(&self) -> usize {
        1024
    }

    fn is_inbound_done(&self) -> bool {
        false
    }

    fn is_outbound_done(&self) -> bool {
        false
    }

    fn application_protocol(&self) -> String {
        self.alpn.clone()
    }
}

/// An engine that fails every call; for fatal-error paths.
pub(crate) struct FailingEngine;

impl TlsEngine for FailingEngine {
    fn wrap(&self, _src: &mut [Bytes], _dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        Err(io::Error::other("wrap exploded"))
    }

    fn unwrap(&self, _src: &mut dyn Buf, _dst: &mut BytesMut) -> io::Result<EngineOutcome> {
        Err(io::Error::other("unwrap exploded"))
    }

    fn next_delegated_task(&self) -> Option<DelegatedTask> {
        None
    }

    fn handshake_status(&self) -> HandshakeStatus {
        HandshakeStatus::NotHandshaking
    }

    fn packet_buffer_size(&self) -> usize {
        1024
    }

    fn application_buffer_size(&self) -> usize {
        1024
    }

    fn is_inbound_done(&self) -> bool {
        false
    }

    fn is_outbound_done(&self) -> bool {
        false
    }

    fn application_protocol(&self) -> String {
        String::new()
    }
}
