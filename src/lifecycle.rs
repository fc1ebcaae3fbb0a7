//! Completion futures for the two pump halves and the ALPN result.
//!
//! A fatal error must reach several observers with the same cause, so
//! causes are reference-counted. Completions are single-assignment: the
//! first `complete` wins and later calls are ignored, which gives the
//! exactly-once delivery the pump relies on.

use parking_lot::Mutex;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// A fatal cause shared between the read half, the write half and the
/// ALPN future.
pub type SharedError = Arc<io::Error>;

enum State<T> {
    Pending(Vec<Waker>),
    Done(Result<T, SharedError>),
}

/// A clonable single-assignment future.
///
/// All clones observe the same result. Completing an already-completed
/// cell is a no-op; `complete` returns whether this call was the one
/// that set the value.
pub struct Completion<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    pub(crate) fn complete(&self, result: Result<T, SharedError>) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *state = State::Done(result);
                    wakers
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    /// The result, if already complete.
    pub fn try_get(&self) -> Option<Result<T, SharedError>> {
        match &*self.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T, SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Done(result) => Poll::Ready(result.clone()),
            State::Pending(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
