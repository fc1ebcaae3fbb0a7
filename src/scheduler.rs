//! Serialized execution of a pipeline's work function.
//!
//! Both pipelines have a single work function that may be triggered from
//! many places at once: upstream delivery, downstream demand, handshake
//! wakeups from the other pipeline, delegated-task completion. The
//! scheduler collapses those triggers so the function runs never
//! concurrently with itself, with at most one re-run queued behind an
//! in-flight run. Between any two stops, the function executes k times
//! where 1 <= k <= number of triggers, and the last execution
//! happens-after the last trigger.
//!
//! The task runs on the triggering thread. There is no queue of threads:
//! a trigger that loses the race just marks the rerun bit and returns.
//!
//! A hook can also defer a run: the pending-run signal is then parked
//! (state `DEFERRED`) with no runner attached, and the next trigger
//! picks it up and polls the hook again.

use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RERUN: u8 = 2;
const STOPPED: u8 = 3;
/// A pending run parked by a `Reschedule` hook; no runner is attached.
const DEFERRED: u8 = 4;

/// Decision made by an `enter_scheduling` hook before each run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingAction {
    /// Run the task now.
    Continue,
    /// Skip this run but keep the pending-run signal parked; the next
    /// trigger polls the hook again.
    Reschedule,
    /// Skip this run and release the slot outright; a pending re-run
    /// signal is discarded with it.
    Return,
}

pub(crate) struct SequentialScheduler {
    state: AtomicU8,
}

impl SequentialScheduler {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Trigger a run of `task`. If another thread is mid-run, record a
    /// pending re-run (that thread picks it up) and return immediately.
    pub(crate) fn run_or_schedule(&self, task: impl FnMut()) {
        self.run_with_hook(|| SchedulingAction::Continue, task);
    }

    /// Like [`run_or_schedule`](Self::run_or_schedule), consulting `hook`
    /// before each run.
    pub(crate) fn run_with_hook(
        &self,
        hook: impl Fn() -> SchedulingAction,
        mut task: impl FnMut(),
    ) {
        // Acquire the running slot, or hand the trigger to whoever holds it.
        loop {
            match self
                .state
                .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(RUNNING) => {
                    if self
                        .state
                        .compare_exchange(RUNNING, RERUN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                    // Lost a race against the runner finishing or another
                    // trigger; re-examine the state.
                }
                Err(DEFERRED) => {
                    // A parked run has no runner; this trigger takes over
                    // and polls the hook again.
                    if self
                        .state
                        .compare_exchange(DEFERRED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        break;
                    }
                }
                Err(RERUN) | Err(STOPPED) => return,
                Err(_) => unreachable!("invalid scheduler state"),
            }
        }

        loop {
            match hook() {
                SchedulingAction::Continue => task(),
                SchedulingAction::Reschedule => {
                    self.park();
                    return;
                }
                SchedulingAction::Return => {
                    self.release();
                    return;
                }
            }

            // Release the slot, or absorb a re-run signal that arrived
            // while the task was executing.
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(RERUN) => {
                    match self.state.compare_exchange(
                        RERUN,
                        RUNNING,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => continue,
                        // stop() raced in; the in-progress sequence ends here.
                        Err(_) => return,
                    }
                }
                Err(STOPPED) => return,
                Err(_) => unreachable!("invalid scheduler state"),
            }
        }
    }

    fn release(&self) {
        loop {
            let s = self.state.load(Ordering::SeqCst);
            if s == STOPPED {
                return;
            }
            if self
                .state
                .compare_exchange(s, IDLE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Give up the runner role but keep the pending-run signal parked.
    /// A concurrent re-run request merges into the parked signal.
    fn park(&self) {
        loop {
            let s = self.state.load(Ordering::SeqCst);
            if s == STOPPED {
                return;
            }
            if self
                .state
                .compare_exchange(s, DEFERRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Prevent all future runs. An in-progress run completes normally.
    pub(crate) fn stop(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STOPPED
    }
}
