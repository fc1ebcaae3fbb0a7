//! Contract between the record pump and the TLS engine that drives it.
//!
//! The engine is treated as a sealed state machine: it encrypts plaintext
//! into records (`wrap`), decrypts records into plaintext (`unwrap`), and
//! reports out-of-band handshake needs through [`HandshakeStatus`]. The
//! pump never looks inside records; it only routes bytes and honors the
//! statuses returned here.

use bytes::{Buf, Bytes, BytesMut};

use std::io;

/// A unit of handshake work yielded by the engine while in
/// [`HandshakeStatus::NeedTask`]. Running it (on any thread) advances the
/// engine's handshake.
pub type DelegatedTask = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Overall status of a single `wrap`/`unwrap` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call consumed and/or produced bytes normally.
    Ok,
    /// The engine's side of the connection is closed.
    Closed,
    /// Not enough source bytes for a complete record. Benign; the caller
    /// waits for more input.
    BufferUnderflow,
    /// The destination buffer cannot hold the output. Benign; the caller
    /// grows the destination and retries.
    BufferOverflow,
}

/// What the engine needs next to make handshake progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The handshake just completed with this call.
    Finished,
    /// The engine must produce bytes; someone has to call `wrap`.
    NeedWrap,
    /// The engine must consume peer bytes; new input will arrive through
    /// the read side.
    NeedUnwrap,
    /// Same as `NeedUnwrap` but the bytes are already buffered inside the
    /// engine (DTLS-style); still resolved by the read side.
    NeedUnwrapAgain,
    /// The engine has delegated tasks that must run before it can
    /// continue.
    NeedTask,
}

/// Result of a single `wrap` or `unwrap` call.
#[derive(Clone, Copy, Debug)]
pub struct EngineOutcome {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// Bytes consumed from the source buffer(s).
    pub consumed: usize,
    /// Bytes written into the destination buffer.
    pub produced: usize,
}

impl EngineOutcome {
    /// True when the engine is mid-handshake and expects the pump to keep
    /// driving it: the handshake status is an active one and the
    /// connection is not closed.
    pub fn handshaking(&self) -> bool {
        self.handshake != HandshakeStatus::NotHandshaking
            && self.handshake != HandshakeStatus::Finished
            && self.status != EngineStatus::Closed
    }
}

/// An [`EngineOutcome`] paired with the destination buffer it produced,
/// sliced to the produced length.
pub(crate) struct EngineRun {
    pub(crate) outcome: EngineOutcome,
    pub(crate) dest: Option<Bytes>,
}

impl EngineRun {
    pub(crate) fn new(outcome: EngineOutcome) -> Self {
        Self {
            outcome,
            dest: None,
        }
    }

    pub(crate) fn with_dest(outcome: EngineOutcome, dest: Bytes) -> Self {
        Self {
            outcome,
            dest: Some(dest),
        }
    }

    pub(crate) fn handshaking(&self) -> bool {
        self.outcome.handshaking()
    }
}

/// The pluggable TLS engine.
///
/// Implementations take `&self` and manage their own interior state. The
/// pump guarantees that `unwrap` is only invoked while it holds the read
/// buffer lock and that `wrap` is only invoked from the writer's
/// serialized task, so at most one call per direction is in flight at a
/// time; one `wrap` may however run concurrently with one `unwrap`.
///
/// Destination discipline: `wrap` and `unwrap` must never grow `dst`
/// beyond its capacity. When the next record's output does not fit in
/// `dst.capacity() - dst.len()`, the engine returns
/// [`EngineStatus::BufferOverflow`] without consuming input; the pump
/// reallocates and retries.
pub trait TlsEngine: Send + Sync {
    /// Encrypt plaintext from `src` (in order, front to back) into `dst`.
    fn wrap(&self, src: &mut [Bytes], dst: &mut BytesMut) -> io::Result<EngineOutcome>;

    /// Decrypt record bytes from `src` into `dst`. Returns
    /// [`EngineStatus::BufferUnderflow`] when `src` does not hold a
    /// complete record.
    fn unwrap(&self, src: &mut dyn Buf, dst: &mut BytesMut) -> io::Result<EngineOutcome>;

    /// Take the next pending delegated task, if any. The pump drains
    /// tasks by calling this until it returns `None`.
    fn next_delegated_task(&self) -> Option<DelegatedTask>;

    /// The engine's current handshake status, outside of any call result.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Size hint for a destination buffer receiving `wrap` output.
    fn packet_buffer_size(&self) -> usize;

    /// Size hint for a destination buffer receiving `unwrap` output.
    fn application_buffer_size(&self) -> usize;

    /// True once the inbound (read) side has seen close_notify.
    fn is_inbound_done(&self) -> bool;

    /// True once the outbound (write) side has been closed.
    fn is_outbound_done(&self) -> bool;

    /// The application protocol negotiated during the handshake, or the
    /// empty string when none was.
    fn application_protocol(&self) -> String;
}
