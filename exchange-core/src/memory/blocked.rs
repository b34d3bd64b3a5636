use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::Result;
use crate::error::Error;

/// Lifecycle of a memory reservation as seen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// The query is over its budget, the reservation is waiting for bytes to be freed.
    Waiting,
    /// The reservation fits in the budget.
    Granted,
    /// The reservation was withdrawn before it was granted.
    Cancelled,
}

/// Blocked resolves once the reservation behind it is granted (or cancelled).
///
/// Every clone observes the same reservation, but none of them can cancel it. A caller that
/// stops waiting (drops the future, wraps it in a timeout, etc.) only gives up its own interest,
/// other waiters and the reservation itself are not affected. Only the [MemoryPool] can resolve
/// or cancel the underlying reservation.
///
/// [MemoryPool]: crate::memory::MemoryPool
#[derive(Debug, Clone)]
pub struct Blocked {
    state: watch::Receiver<ReservationState>,
}

impl Blocked {
    /// An already resolved signal.
    pub fn ready() -> Self {
        let (_, state) = watch::channel(ReservationState::Granted);
        Self { state }
    }

    /// A pending signal together with the sender that resolves it.
    pub(crate) fn waiting() -> (watch::Sender<ReservationState>, Self) {
        let (tx, state) = watch::channel(ReservationState::Waiting);
        (tx, Self { state })
    }

    /// Current state without waiting. A reservation whose resolver went away is reported as
    /// cancelled.
    pub fn state(&self) -> ReservationState {
        let state = *self.state.borrow();
        if state == ReservationState::Waiting && self.state.has_changed().is_err() {
            return ReservationState::Cancelled;
        }
        state
    }

    pub fn is_done(&self) -> bool {
        self.state() != ReservationState::Waiting
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ReservationState::Cancelled
    }

    /// Waits till the reservation is granted. Returns [Error::ReservationCancelled] if it was
    /// cancelled instead.
    pub async fn wait(mut self) -> Result<()> {
        let state = match self
            .state
            .wait_for(|state| *state != ReservationState::Waiting)
            .await
        {
            Ok(state) => *state,
            Err(_) => ReservationState::Cancelled,
        };

        match state {
            ReservationState::Granted => Ok(()),
            ReservationState::Waiting | ReservationState::Cancelled => {
                Err(Error::ReservationCancelled)
            }
        }
    }
}

impl IntoFuture for Blocked {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
