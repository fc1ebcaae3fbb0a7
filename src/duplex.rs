//! The record pump itself: two pipelines sharing one engine.
//!
//! ```text
//! --------->  data flow direction
//!
//!                           +------------------+
//!       upstream_writer     |                  |  down_writer
//!       ------------------> |                  | ------------->
//!   obtained from this      |    TlsDuplex     |  supplied to constructor
//!                           |                  |
//!       down_reader         |                  |  upstream_reader
//!       <------------------ |                  | <-------------
//!   supplied to constructor |                  |  obtained from this
//!                           +------------------+
//! ```
//!
//! Plaintext enters through [`TlsDuplex::upstream_writer`] and leaves,
//! encrypted, through the `down_writer` sink; ciphertext enters through
//! [`TlsDuplex::upstream_reader`] and leaves, decrypted, through the
//! `down_reader` sink. The handshake is driven automatically, starting
//! when the writer's upstream attaches, and the negotiated application
//! protocol is surfaced through [`TlsDuplex::alpn`].

use log::{debug, error};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::engine::{EngineOutcome, HandshakeStatus, TlsEngine};
use crate::executor::TaskExecutor;
use crate::flow::{FrameSink, SubscriberHalf};
use crate::handshake::{Caller, HandshakeState};
use crate::lifecycle::{Completion, SharedError};
use crate::reader::Reader;
use crate::record_buffer;
use crate::writer::Writer;

static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Tuning knobs for a pump instance. The defaults suit TLS record sizes;
/// they exist so tests and unusual transports can tighten or relax the
/// flow-control thresholds.
#[derive(Clone, Debug)]
pub struct DuplexConfig {
    /// Starting capacity of the read buffer.
    pub initial_read_capacity: usize,
    /// Readable ciphertext length above which upstream credit stops.
    pub target_read_buffer: usize,
    /// Hard bound on read buffer capacity; exceeding it is fatal.
    pub max_read_buffer: usize,
    /// Write queue length above which upstream credit stops.
    pub max_write_queue: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            initial_read_capacity: record_buffer::INITIAL_CAPACITY,
            target_read_buffer: record_buffer::TARGET_BUFSIZE,
            max_read_buffer: record_buffer::MAX_CAPACITY,
            max_write_queue: 10,
        }
    }
}

/// State shared by the two pipelines, the coordinator and the facade.
pub(crate) struct Core {
    pub(crate) engine: Arc<dyn TlsEngine>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) config: DuplexConfig,
    pub(crate) hs_state: HandshakeState,
    pub(crate) alpn: Completion<String>,
    pub(crate) reader_done: Completion<()>,
    pub(crate) writer_done: Completion<()>,
    id: usize,
    close_notify_received: AtomicBool,
    stopped: AtomicBool,
    reader: OnceLock<Weak<Reader>>,
    writer: OnceLock<Weak<Writer>>,
}

impl Core {
    pub(crate) fn reader(&self) -> Option<Arc<Reader>> {
        self.reader.get().and_then(Weak::upgrade)
    }

    pub(crate) fn writer(&self) -> Option<Arc<Writer>> {
        self.writer.get().and_then(Weak::upgrade)
    }

    /// Re-run both work functions. Cheap when nothing changed.
    pub(crate) fn resume_activity(&self) {
        if let Some(reader) = self.reader() {
            reader.schedule();
        }
        if let Some(writer) = self.writer() {
            writer.schedule();
        }
    }

    /// Resolve the ALPN future from the engine, if still pending.
    pub(crate) fn set_alpn(&self) {
        if self.alpn.is_done() {
            return;
        }
        let alpn = self.engine.application_protocol();
        debug!("tls duplex {}: alpn = {:?}", self.id, alpn);
        self.alpn.complete(Ok(alpn));
    }

    pub(crate) fn close_notify_received(&self) -> bool {
        self.close_notify_received.load(Ordering::SeqCst)
    }

    /// Reader-side reaction to a `Closed` unwrap: when the peer closed
    /// its outbound half and ours is still open, acknowledge by letting
    /// the writer produce the answering close_notify.
    pub(crate) fn do_closure(self: &Arc<Self>, outcome: &EngineOutcome) -> io::Result<()> {
        debug!(
            "tls duplex {}: closure, engine status {:?}, inbound done {}, outbound done {}",
            self.id,
            self.engine.handshake_status(),
            self.engine.is_inbound_done(),
            self.engine.is_outbound_done()
        );
        if self.engine.handshake_status() == HandshakeStatus::NeedWrap
            && self.engine.is_inbound_done()
            && !self.engine.is_outbound_done()
        {
            debug!("tls duplex {}: close_notify received", self.id);
            self.close_notify_received.store(true, Ordering::SeqCst);
            let _ = self.do_handshake(outcome, Caller::Reader)?;
        }
        Ok(())
    }

    /// Fatal teardown: both halves and ALPN complete exceptionally with
    /// the same cause, downstream sinks get their one terminal error,
    /// both schedulers stop. Idempotent; the first cause wins.
    pub(crate) fn handle_error(&self, err: io::Error) {
        error!("tls duplex {}: fatal: {}", self.id, err);
        let cause: SharedError = Arc::new(err);
        self.reader_done.complete(Err(cause.clone()));
        self.writer_done.complete(Err(cause.clone()));
        // No-op if ALPN already resolved.
        self.alpn.complete(Err(cause.clone()));
        if let Some(reader) = self.reader() {
            reader.half().deliver_error(&cause);
            reader.stop();
        }
        if let Some(writer) = self.writer() {
            writer.half().deliver_error(&cause);
            writer.stop();
        }
    }

    /// A pipeline delivered its terminal completion downstream.
    pub(crate) fn half_completed(&self, caller: Caller) {
        debug!("tls duplex {}: {:?} half completed", self.id, caller);
        match caller {
            Caller::Reader => self.reader_done.complete(Ok(())),
            Caller::Writer => self.writer_done.complete(Ok(())),
        };
        if self.reader_done.is_done() && self.writer_done.is_done() {
            self.normal_stop();
        }
    }

    fn normal_stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("tls duplex {}: stop", self.id);
        if let Some(reader) = self.reader() {
            reader.stop();
        }
        if let Some(writer) = self.writer() {
            writer.stop();
        }
    }
}

/// A bidirectional TLS record pump around a pluggable engine.
///
/// Construction wires the two downstream sinks and returns the facade;
/// the upstream transports are attached afterwards via the endpoints'
/// `subscribe_upstream`. Dropping the facade drops both pipelines.
pub struct TlsDuplex {
    core: Arc<Core>,
    reader: Arc<Reader>,
    writer: Arc<Writer>,
}

impl TlsDuplex {
    pub fn new(
        engine: Arc<dyn TlsEngine>,
        executor: Arc<dyn TaskExecutor>,
        down_reader: Box<dyn FrameSink>,
        down_writer: Box<dyn FrameSink>,
    ) -> Self {
        Self::with_config(engine, executor, down_reader, down_writer, DuplexConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn TlsEngine>,
        executor: Arc<dyn TaskExecutor>,
        down_reader: Box<dyn FrameSink>,
        down_writer: Box<dyn FrameSink>,
        config: DuplexConfig,
    ) -> Self {
        let core = Arc::new(Core {
            engine,
            executor,
            config,
            hs_state: HandshakeState::new(),
            alpn: Completion::new(),
            reader_done: Completion::new(),
            writer_done: Completion::new(),
            id: INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed),
            close_notify_received: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            reader: OnceLock::new(),
            writer: OnceLock::new(),
        });

        let reader_half = SubscriberHalf::new("reader", down_reader);
        let writer_half = SubscriberHalf::new("writer", down_writer);
        let reader = Reader::new(core.clone(), reader_half.clone());
        let writer = Writer::new(core.clone(), writer_half.clone());
        let _ = core.reader.set(Arc::downgrade(&reader));
        let _ = core.writer.set(Arc::downgrade(&writer));

        // Connect the sinks: each receives its demand handle now.
        reader_half.subscribe_sink();
        writer_half.subscribe_sink();

        Self {
            core,
            reader,
            writer,
        }
    }

    /// The endpoint fed with encrypted bytes read from the network.
    pub fn upstream_reader(&self) -> Arc<Reader> {
        self.reader.clone()
    }

    /// The endpoint fed with plaintext bytes to be encrypted.
    pub fn upstream_writer(&self) -> Arc<Writer> {
        self.writer.clone()
    }

    /// Completes once the initial handshake finishes (or, at the latest,
    /// at end-of-stream) with the negotiated application protocol.
    pub fn alpn(&self) -> Completion<String> {
        self.core.alpn.clone()
    }

    /// Completes when the read half has delivered its terminal signal.
    pub fn read_completion(&self) -> Completion<()> {
        self.core.reader_done.clone()
    }

    /// Completes when the write half has delivered its terminal signal.
    pub fn write_completion(&self) -> Completion<()> {
        self.core.writer_done.clone()
    }

    /// Whether a TLS close_notify from the peer has been observed.
    pub fn close_notify_received(&self) -> bool {
        self.core.close_notify_received()
    }

    /// Force a re-run of the read pipeline. Returns false once the
    /// reader has stopped.
    pub fn resume_reader(&self) -> bool {
        if self.reader.is_stopped() {
            return false;
        }
        self.reader.schedule();
        true
    }

    /// Zero the reader's outstanding downstream demand, e.g. when the
    /// downstream subscriber is being swapped out.
    pub fn reset_reader_demand(&self) {
        self.reader.half().reset_demand();
    }

    /// One-line state dump for debug logging.
    pub fn state_summary(&self) -> String {
        format!(
            "tls duplex {}: state {}, engine {:?}, reader[buffered {}, delivered {}], writer[queued {}]",
            self.core.id,
            self.core.hs_state.describe(),
            self.core.engine.handshake_status(),
            self.reader.buffered(),
            self.reader.delivered(),
            self.writer.queued(),
        )
    }
}
