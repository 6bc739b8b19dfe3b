//! Cooperative cancellation for dependency runs.
//!
//! Every run of an update function receives a fresh `CancellationToken`.
//! Starting a new run cancels the previous token synchronously, before the new
//! run is spawned. Update functions may observe the token (`check`, `guard`)
//! to stop early, but they don't have to: the graph discards completions whose
//! token is no longer current.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::UpdateError;

#[derive(Default)]
struct TokenState {
    cancelled: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
}

/// Single-threaded cancellation signal. Clones share the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Rc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every pending `cancelled()` future.
    /// Cancelling twice is a no-op.
    pub fn cancel(&self) {
        if self.state.cancelled.replace(true) {
            return;
        }
        let wakers = std::mem::take(&mut *self.state.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// `Err(UpdateError::Cancelled)` once cancelled. Use with `?` between
    /// awaits.
    pub fn check(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }

    /// Race `fut` against cancellation. The future is dropped as soon as the
    /// token fires.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, UpdateError> {
        smol::future::or(async { Ok(fut.await) }, async {
            self.cancelled().await;
            Err(UpdateError::Cancelled)
        })
        .await
    }

    /// True if both handles refer to the same token.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancellationToken::cancelled`].
pub struct Cancelled {
    token: CancellationToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        let mut wakers = self.token.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
