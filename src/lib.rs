//! tls-duplex - a bidirectional TLS record pump around a pluggable engine.
//!
//! This library mediates between a plaintext application side and an
//! encrypted network side. The TLS engine itself (the thing that knows
//! how to encrypt, decrypt and handshake) is supplied by the caller
//! behind the [`TlsEngine`] trait; the pump's job is everything around
//! it:
//!
//! - drive the handshake to completion, surfacing the negotiated
//!   application protocol through a future
//! - encrypt plaintext writes into record writes, decrypt record reads
//!   into plaintext reads, continuously and in order
//! - honor the engine's out-of-band requests: produce bytes on the other
//!   side, wait for peer bytes, run delegated tasks on an executor
//! - apply demand-based flow control on all four endpoints with bounded
//!   buffering
//! - propagate close and error conditions symmetrically, exactly once
//!
//! The two directions are independent pipelines, each serialized on its
//! own scheduler, cooperating only through the shared handshake state
//! and a trigger entry on the writer's queue. See [`TlsDuplex`] for the
//! wiring diagram.

mod duplex;
mod engine;
mod executor;
mod flow;
mod handshake;
mod lifecycle;
mod reader;
mod record_buffer;
mod scheduler;
mod writer;

#[cfg(test)]
mod test_util;

pub use duplex::{DuplexConfig, TlsDuplex};
pub use engine::{DelegatedTask, EngineOutcome, EngineStatus, HandshakeStatus, TlsEngine};
pub use executor::{Job, TaskExecutor, TaskPool};
pub use flow::{Demand, FrameSink, UpstreamSubscription};
pub use lifecycle::{Completion, SharedError};
pub use reader::Reader;
pub use scheduler::SchedulingAction;
pub use writer::Writer;
