//! Memory accounting for the blocks buffered by sink handles.
//!
//! Every sink handle of a query reserves the retained size of the blocks it buffers from the
//! shared [MemoryPool] and frees it once the blocks are acknowledged or discarded. When a query
//! goes over its budget the reservation is still recorded, but the returned [Blocked] signal
//! stays pending until enough bytes of that query are freed. The producer observes this through
//! `SinkHandle::is_full` and must wait for it before sending again.

/// Non-cancellation-propagating view of a reservation.
mod blocked;
/// Per-query byte budget with FIFO waiters.
mod pool;

pub use blocked::{Blocked, ReservationState};
pub use pool::{MemoryPool, Reservation, ReservationId};
