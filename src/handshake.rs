//! Handshake coordination between the two pipelines.
//!
//! Handshake traffic crosses directions: an `unwrap` on the read side can
//! require a `wrap` on the write side and vice versa, and the engine can
//! park both directions behind delegated tasks. The coordinator owns the
//! shared state that arbitrates this: a mode latch (`HANDSHAKING`) that
//! either pipeline sets when it observes an active handshake and clears
//! when the engine reports it finished, and an orthogonal `DOING_TASKS`
//! bit guaranteeing at most one executor job is running delegated tasks.
//!
//! The coordinator never calls into the other pipeline's work function
//! directly; it enqueues a handshake trigger on the writer's queue and
//! pokes its scheduler, or hands work to the executor. It never blocks
//! while holding a lock.

use log::debug;

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::duplex::Core;
use crate::engine::{DelegatedTask, EngineOutcome, HandshakeStatus};

const MODE_HANDSHAKING: u32 = 1;
const DOING_TASKS: u32 = 4;

/// Atomic cell combining the handshake mode with the tasks-running bit.
/// The two fields never change together, so single-bit RMW ops suffice.
pub(crate) struct HandshakeState(AtomicU32);

impl HandshakeState {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Enter handshake mode, preserving `DOING_TASKS`.
    pub(crate) fn set_handshaking(&self) {
        self.0.fetch_or(MODE_HANDSHAKING, Ordering::SeqCst);
    }

    /// Leave handshake mode, preserving `DOING_TASKS`. Returns whether
    /// the mode was set, i.e. whether this call ended a handshake.
    pub(crate) fn clear_handshaking(&self) -> bool {
        let prev = self.0.fetch_and(!MODE_HANDSHAKING, Ordering::SeqCst);
        prev & MODE_HANDSHAKING != 0
    }

    /// Claim the right to run delegated tasks. Fails when another caller
    /// already holds it.
    pub(crate) fn try_start_tasks(&self) -> bool {
        let prev = self.0.fetch_or(DOING_TASKS, Ordering::SeqCst);
        prev & DOING_TASKS == 0
    }

    pub(crate) fn finish_tasks(&self) {
        self.0.fetch_and(!DOING_TASKS, Ordering::SeqCst);
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.0.load(Ordering::SeqCst) & MODE_HANDSHAKING != 0
    }

    pub(crate) fn doing_tasks(&self) -> bool {
        self.0.load(Ordering::SeqCst) & DOING_TASKS != 0
    }

    pub(crate) fn describe(&self) -> String {
        let s = self.0.load(Ordering::SeqCst);
        let mode = if s & MODE_HANDSHAKING != 0 {
            "HANDSHAKING"
        } else {
            "NOT_HANDSHAKING"
        };
        if s & DOING_TASKS != 0 {
            format!("{mode}|DOING_TASKS")
        } else {
            mode.to_string()
        }
    }
}

/// Which pipeline observed the handshake step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Caller {
    Reader,
    Writer,
}

impl Core {
    /// React to a handshake step observed by `caller`.
    ///
    /// Returns `Ok(true)` when the caller may continue normally, and
    /// `Ok(false)` when progress was handed elsewhere: to the executor
    /// (delegated tasks resume both pipelines when done) or to the
    /// writer (a queued trigger produces the bytes the engine wants).
    pub(crate) fn do_handshake(
        self: &Arc<Self>,
        outcome: &EngineOutcome,
        caller: Caller,
    ) -> io::Result<bool> {
        self.hs_state.set_handshaking();
        match outcome.handshake {
            HandshakeStatus::NeedTask => {
                if !self.hs_state.try_start_tasks() {
                    // Someone else is already running tasks.
                    return Ok(false);
                }
                debug!("tls handshake: obtaining and initiating task execution");
                let tasks = self.drain_tasks();
                self.execute_tasks(tasks);
                Ok(false)
            }
            HandshakeStatus::NeedWrap => {
                if caller == Caller::Reader {
                    // The writer produces the bytes; wake it with a
                    // trigger so its next run calls wrap even with an
                    // empty queue.
                    self.trigger_writer_wrap();
                    return Ok(false);
                }
                // The ongoing write loop satisfies the need itself.
                Ok(true)
            }
            HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedUnwrapAgain => {
                // Peer bytes arriving on the read side resolve this.
                Ok(true)
            }
            status => Err(io::Error::other(format!(
                "unexpected handshake status: {status:?}"
            ))),
        }
    }

    /// Enqueue a handshake trigger on the writer and poke its scheduler.
    pub(crate) fn trigger_writer_wrap(&self) {
        if let Some(writer) = self.writer() {
            writer.push_trigger();
            writer.schedule();
        }
    }

    fn drain_tasks(&self) -> Vec<DelegatedTask> {
        let mut tasks = Vec::new();
        while let Some(task) = self.engine.next_delegated_task() {
            tasks.push(task);
        }
        tasks
    }

    /// Run delegated tasks on the executor, re-draining while the engine
    /// keeps asking, then release the tasks bit and resume both sides.
    fn execute_tasks(self: &Arc<Self>, tasks: Vec<DelegatedTask>) {
        if tasks.is_empty() {
            self.hs_state.finish_tasks();
            self.resume_activity();
            return;
        }
        let core = self.clone();
        self.executor.execute(Box::new(move || {
            let mut tasks = tasks;
            let result: io::Result<()> = loop {
                let mut failed = None;
                for task in tasks.drain(..) {
                    if let Err(err) = task() {
                        failed = Some(err);
                        break;
                    }
                }
                if let Some(err) = failed {
                    break Err(err);
                }
                if core.engine.handshake_status() == HandshakeStatus::NeedTask {
                    tasks = core.drain_tasks();
                    if tasks.is_empty() {
                        break Ok(());
                    }
                } else {
                    break Ok(());
                }
            };
            match result {
                Ok(()) => {
                    core.hs_state.finish_tasks();
                    core.resume_activity();
                }
                Err(err) => core.handle_error(err),
            }
        }));
    }
}
