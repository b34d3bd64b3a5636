//! The sink side of an exchange edge.
//!
//! A [SinkHandle] buffers the blocks produced by a fragment instance until the consumer pulls
//! and acknowledges them. Producing is never blocked inline: every accepted batch reserves its
//! memory up front and hands back a [Blocked] signal which the producer has to observe before
//! sending again. The consumer is told about new blocks (and the end of the stream) through
//! events pushed by the [Deliverer].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::Result;
use crate::block::DataBlock;
use crate::client::ClientManager;
use crate::config::SinkHandleConfig;
use crate::error::Error;
use crate::event::DataBlockEvent;
use crate::ids::ExchangeEdge;
use crate::memory::{Blocked, MemoryPool, ReservationId};
use crate::metrics::{exchange_metrics, remove_sink_metrics, sink_metric_labels};

mod delivery;
mod listener;

pub(crate) use delivery::Deliverer;
pub use listener::SinkHandleListener;

/// Where the handle is in its lifecycle. `Finished` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Open,
    /// The producer is done (or the handle was closed), buffered blocks may still be pulled.
    NoMoreBlocks,
    Finished,
    Aborted,
}

struct SinkState<B> {
    blocks: BTreeMap<u64, Arc<B>>,
    next_sequence_id: u64,
    buffer_retained_size: u64,
    blocked: Blocked,
    /// Reservation backing `blocked`, kept until abort so a still waiting one can be cancelled.
    pending_reservation: Option<ReservationId>,
    status: SinkStatus,
    closed: bool,
    closing: bool,
    /// `on_aborted` fired, kept apart from `status` so a finished handle stays finished.
    abort_notified: bool,
}

impl<B> SinkState<B> {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next_sequence_id: 0,
            buffer_retained_size: 0,
            blocked: Blocked::ready(),
            pending_reservation: None,
            status: SinkStatus::Open,
            closed: false,
            closing: false,
            abort_notified: false,
        }
    }

    fn no_more_blocks(&self) -> bool {
        self.status != SinkStatus::Open
    }

    fn set_no_more_blocks(&mut self) {
        if self.status == SinkStatus::Open {
            self.status = SinkStatus::NoMoreBlocks;
        }
    }

    /// Moves to `Finished` once nothing is left to pull. Returns true for the one call that made
    /// the transition.
    fn try_finish(&mut self) -> bool {
        if self.status == SinkStatus::NoMoreBlocks && self.blocks.is_empty() {
            self.status = SinkStatus::Finished;
            true
        } else {
            false
        }
    }
}

/// Resets the `closing` flag if `close` does not get to the end, e.g. the future was dropped
/// while the end of data block event was in flight.
struct ClosingGuard<'a, B> {
    state: &'a Mutex<SinkState<B>>,
    armed: bool,
}

impl<B> Drop for ClosingGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().closing = false;
        }
    }
}

pub struct SinkHandle<B, M> {
    edge: Arc<ExchangeEdge>,
    memory_pool: Arc<MemoryPool>,
    listener: Arc<dyn SinkHandleListener>,
    deliverer: Deliverer<M>,
    runtime: Handle,
    /// New data block events in flight.
    deliveries: TaskTracker,
    cancel: CancellationToken,
    metric_labels: Vec<(String, String)>,
    state: Mutex<SinkState<B>>,
}

impl<B, M> SinkHandle<B, M>
where
    B: DataBlock,
    M: ClientManager + Send + Sync + 'static,
{
    /// Creates an open handle for `edge`. Delivery tasks are spawned on `runtime`.
    pub fn new(
        edge: ExchangeEdge,
        memory_pool: Arc<MemoryPool>,
        client_manager: Arc<M>,
        listener: Arc<dyn SinkHandleListener>,
        config: &SinkHandleConfig,
        runtime: Handle,
    ) -> Self {
        let edge = Arc::new(edge);
        let metric_labels = sink_metric_labels(&edge);
        Self {
            deliverer: Deliverer::new(Arc::clone(&edge), client_manager, config),
            edge,
            memory_pool,
            listener,
            runtime,
            deliveries: TaskTracker::new(),
            cancel: CancellationToken::new(),
            metric_labels,
            state: Mutex::new(SinkState::new()),
        }
    }

    pub fn edge(&self) -> &ExchangeEdge {
        &self.edge
    }

    /// Signal the producer has to wait on before the next [send](Self::send). It is resolved if
    /// the query is within its memory budget.
    pub fn is_full(&self) -> Result<Blocked> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state.blocked.clone())
    }

    /// Buffers `blocks` under contiguous sequence ids and tells the consumer about them in the
    /// background. Blocks sent after [set_no_more_blocks](Self::set_no_more_blocks) are
    /// silently dropped.
    pub fn send(&self, blocks: Vec<B>) -> Result<()> {
        let (start_sequence_id, block_sizes) = {
            let mut state = self.state.lock();
            if state.closed || state.closing {
                return Err(Error::Closed);
            }
            if !state.blocked.is_done() {
                return Err(Error::Blocked);
            }
            if state.no_more_blocks() || blocks.is_empty() {
                return Ok(());
            }

            let block_sizes: Vec<u64> = blocks
                .iter()
                .map(B::retained_size_in_bytes)
                .collect();
            let retained_size: u64 = block_sizes.iter().sum();
            let reservation = self
                .memory_pool
                .reserve(self.edge.query_id(), retained_size)?;
            state.pending_reservation = Some(reservation.id);
            state.blocked = reservation.blocked;
            state.buffer_retained_size += retained_size;

            let start_sequence_id = state.next_sequence_id;
            for block in blocks {
                let sequence_id = state.next_sequence_id;
                state.blocks.insert(sequence_id, Arc::new(block));
                state.next_sequence_id += 1;
            }
            self.record_buffer_metrics(&state);
            (start_sequence_id, block_sizes)
        };

        debug!(
            edge = %self.edge,
            start_sequence_id,
            count = block_sizes.len(),
            "Buffered data blocks"
        );
        self.submit_new_data_block_event(start_sequence_id, block_sizes);
        Ok(())
    }

    fn submit_new_data_block_event(&self, start_sequence_id: u64, block_sizes: Vec<u64>) {
        let event = self
            .deliverer
            .new_data_block_event(start_sequence_id, block_sizes);
        let deliverer = self.deliverer.clone();
        let listener = Arc::clone(&self.listener);
        let edge = Arc::clone(&self.edge);
        let cancel = self.cancel.clone();

        self.deliveries.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%edge, start_sequence_id, "Sink handle aborted, dropping new data block event");
                    }
                    result = deliverer.deliver(DataBlockEvent::NewData(event)) => {
                        if let Err(e) = result {
                            error!(%edge, start_sequence_id, error = %e, "Giving up on new data block event");
                            listener.on_failure(&edge, e);
                        }
                    }
                }
            },
            &self.runtime,
        );
    }

    /// Marks that the producer won't send anything else. Finishes the handle right away if all
    /// the buffered blocks were acknowledged.
    pub fn set_no_more_blocks(&self) {
        let finished = {
            let mut state = self.state.lock();
            state.set_no_more_blocks();
            let finished = state.try_finish();
            self.record_buffer_metrics(&state);
            finished
        };
        if finished {
            self.notify_finished();
        }
    }

    /// Serialized form of a buffered block. The block stays buffered until it is acknowledged.
    pub fn get_serialized_block(&self, sequence_id: u64) -> Result<Bytes> {
        let block = self.state.lock().blocks.get(&sequence_id).map(Arc::clone);
        match block {
            Some(block) => block.serialize(),
            None => Err(Error::BlockNotFound(sequence_id)),
        }
    }

    /// Releases the blocks `[start_sequence_id, end_sequence_id)` still in the buffer and gives
    /// their bytes back to the memory pool. Already released ids are skipped.
    pub fn acknowledge(&self, start_sequence_id: u64, end_sequence_id: u64) -> Result<()> {
        if start_sequence_id >= end_sequence_id {
            return Ok(());
        }

        let (freed, finished) = {
            let mut state = self.state.lock();
            let acknowledged: Vec<u64> = state
                .blocks
                .range(start_sequence_id..end_sequence_id)
                .map(|(sequence_id, _)| *sequence_id)
                .collect();
            let mut freed = 0;
            for sequence_id in acknowledged {
                if let Some(block) = state.blocks.remove(&sequence_id) {
                    freed += block.retained_size_in_bytes();
                }
            }
            state.buffer_retained_size -= freed;
            let finished = state.try_finish();
            self.record_buffer_metrics(&state);
            (freed, finished)
        };

        debug!(
            edge = %self.edge,
            start_sequence_id,
            end_sequence_id,
            freed,
            "Acknowledged data blocks"
        );
        let freed_result = self.memory_pool.free(self.edge.query_id(), freed);
        if finished {
            self.notify_finished();
        }
        freed_result
    }

    /// Sends the end of data block event and closes the handle. Buffered blocks can still be
    /// pulled afterwards. If the event can't be delivered the handle stays open for another try
    /// and the delivery error is returned. Closing a closed handle is a no-op, a close racing
    /// another one still in flight fails with [Error::Closing].
    pub async fn close(&self) -> Result<()> {
        let last_sequence_id = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if state.closing {
                return Err(Error::Closing);
            }
            state.closing = true;
            state.next_sequence_id.checked_sub(1)
        };
        let mut closing = ClosingGuard {
            state: &self.state,
            armed: true,
        };
        info!(edge = %self.edge, ?last_sequence_id, "Closing sink handle");

        let event = self.deliverer.end_of_data_block_event(last_sequence_id);
        if let Err(e) = self
            .deliverer
            .deliver(DataBlockEvent::EndOfData(event))
            .await
        {
            error!(edge = %self.edge, error = %e, "Failed to close sink handle");
            return Err(e);
        }

        let finished = {
            let mut state = self.state.lock();
            closing.armed = false;
            state.closing = false;
            if state.closed {
                // aborted while the event was in flight
                return Ok(());
            }
            state.closed = true;
            state.set_no_more_blocks();
            let finished = state.try_finish();
            self.record_buffer_metrics(&state);
            finished
        };
        if finished {
            self.notify_finished();
        }
        self.listener.on_closed(&self.edge);
        info!(edge = %self.edge, "Sink handle closed");
        Ok(())
    }

    /// Drops every buffered block, releases their memory and cancels the in-flight deliveries.
    /// `on_aborted` fires once however many times this is called. A finished handle has nothing
    /// left to release and stays finished.
    pub fn abort(&self) {
        let (freed, waiting_reservation) = {
            let mut state = self.state.lock();
            state.closed = true;
            if state.abort_notified {
                return;
            }
            state.abort_notified = true;
            if state.status == SinkStatus::Finished {
                drop(state);
                info!(edge = %self.edge, "Aborting finished sink handle");
                self.cancel.cancel();
                self.listener.on_aborted(&self.edge);
                return;
            }
            state.blocks.clear();
            state.status = SinkStatus::Aborted;
            let waiting_reservation = state
                .pending_reservation
                .take()
                .filter(|_| !state.blocked.is_done());
            let freed = std::mem::take(&mut state.buffer_retained_size);
            self.record_buffer_metrics(&state);
            (freed, waiting_reservation)
        };
        info!(edge = %self.edge, freed, "Aborting sink handle");

        self.cancel.cancel();
        let query_id = self.edge.query_id();
        if let Some(id) = waiting_reservation {
            self.memory_pool.cancel(query_id, id);
        }
        if let Err(e) = self.memory_pool.free(query_id, freed) {
            error!(edge = %self.edge, error = %e, "Failed to release memory of aborted sink handle");
        }
        self.listener.on_aborted(&self.edge);
    }

    fn notify_finished(&self) {
        info!(edge = %self.edge, "Sink handle finished");
        self.listener.on_finish(&self.edge);
    }

    /// Must be called under the state lock, after any status transition.
    fn record_buffer_metrics(&self, state: &SinkState<B>) {
        if matches!(state.status, SinkStatus::Finished | SinkStatus::Aborted) {
            remove_sink_metrics(&self.metric_labels);
            return;
        }
        let metrics = &exchange_metrics().sink;
        metrics
            .buffered_bytes
            .get_or_create(&self.metric_labels)
            .set(i64::try_from(state.buffer_retained_size).unwrap_or(i64::MAX));
        metrics
            .buffered_blocks
            .get_or_create(&self.metric_labels)
            .set(i64::try_from(state.blocks.len()).unwrap_or(i64::MAX));
    }

    pub fn status(&self) -> SinkStatus {
        self.state.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_finished(&self) -> bool {
        self.status() == SinkStatus::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == SinkStatus::Aborted
    }

    pub fn buffer_retained_size_in_bytes(&self) -> u64 {
        self.state.lock().buffer_retained_size
    }

    pub fn buffered_block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Sequence id the next sent block will get.
    pub fn next_sequence_id(&self) -> u64 {
        self.state.lock().next_sequence_id
    }

    /// New data block events still being delivered.
    pub fn in_flight_deliveries(&self) -> usize {
        self.deliveries.len()
    }
}

impl<B, M> fmt::Display for SinkHandle<B, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.edge)
    }
}
