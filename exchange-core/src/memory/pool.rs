use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::Result;
use crate::config::MemoryPoolConfig;
use crate::error::Error;
use crate::ids::QueryId;
use crate::memory::blocked::{Blocked, ReservationState};
use crate::metrics::{exchange_metrics, query_metric_labels};

/// Identifies a reservation so that a waiting one can be cancelled.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ReservationId(u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of [MemoryPool::reserve].
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub blocked: Blocked,
}

/// A reservation that did not fit in the budget when it was requested.
#[derive(Debug)]
struct Waiter {
    id: ReservationId,
    /// Bytes of the reservation not freed yet.
    remaining: u64,
    signal: watch::Sender<ReservationState>,
}

/// Accounting of a single query. `granted + waiting_bytes` is everything reserved and not yet
/// freed, so freeing is exact regardless of whether the freed bytes were granted yet.
#[derive(Debug, Default)]
struct QueryBudget {
    granted: u64,
    waiters: VecDeque<Waiter>,
    waiting_bytes: u64,
    /// Set once the entry is dropped from the pool, a retired budget is never used again.
    retired: bool,
}

impl QueryBudget {
    fn used(&self) -> u64 {
        self.granted + self.waiting_bytes
    }

    fn is_idle(&self) -> bool {
        self.used() == 0 && self.waiters.is_empty()
    }

    /// Takes freed bytes out of the most recent waiters first, then out of the granted bytes.
    /// This never lets `granted` drop below what the granted reservations still hold.
    fn release(&mut self, bytes: u64) {
        let mut rest = bytes;
        for waiter in self.waiters.iter_mut().rev() {
            if rest == 0 {
                break;
            }
            let taken = rest.min(waiter.remaining);
            waiter.remaining -= taken;
            self.waiting_bytes -= taken;
            rest -= taken;
        }
        self.granted -= rest;
    }

    /// Grants waiters in arrival order. Stops at the first one which does not fit so that a large
    /// reservation is never starved by smaller ones queued behind it.
    fn grant_waiters(&mut self, max_bytes: u64) {
        while let Some(front) = self.waiters.front() {
            if self.granted.saturating_add(front.remaining) > max_bytes {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.waiting_bytes -= waiter.remaining;
            self.granted += waiter.remaining;
            debug!(reservation = %waiter.id, bytes = waiter.remaining, "Memory reservation granted");
            waiter.signal.send_replace(ReservationState::Granted);
        }
    }
}

/// MemoryPool bounds the bytes buffered by all the sink handles of a query, and hands out
/// [Blocked] signals instead of blocking the caller when a query is over budget.
///
/// Reservations of a query are serialized by that query's lock only, independent queries never
/// contend with each other.
#[derive(Debug)]
pub struct MemoryPool {
    max_bytes_per_query: u64,
    queries: Mutex<HashMap<QueryId, Arc<Mutex<QueryBudget>>>>,
    total_reserved: AtomicU64,
    next_reservation_id: AtomicU64,
}

impl MemoryPool {
    pub fn new(config: &MemoryPoolConfig) -> Self {
        Self {
            max_bytes_per_query: config.max_bytes_per_query,
            queries: Mutex::new(HashMap::new()),
            total_reserved: AtomicU64::new(0),
            next_reservation_id: AtomicU64::new(0),
        }
    }

    pub fn max_bytes_per_query(&self) -> u64 {
        self.max_bytes_per_query
    }

    fn budget(&self, query_id: &QueryId) -> Arc<Mutex<QueryBudget>> {
        let mut queries = self.queries.lock();
        Arc::clone(queries.entry(query_id.clone()).or_default())
    }

    fn existing_budget(&self, query_id: &QueryId) -> Option<Arc<Mutex<QueryBudget>>> {
        self.queries.lock().get(query_id).map(Arc::clone)
    }

    /// Records `bytes` against the query. The returned signal is already resolved if the query
    /// stays within its budget, otherwise it resolves once enough bytes of the query are freed
    /// (by any of its sink handles).
    pub fn reserve(&self, query_id: &QueryId, bytes: u64) -> Result<Reservation> {
        let id = ReservationId(self.next_reservation_id.fetch_add(1, Ordering::Relaxed));
        if bytes == 0 {
            return Ok(Reservation {
                id,
                blocked: Blocked::ready(),
            });
        }
        if bytes > self.max_bytes_per_query {
            return Err(Error::Memory(format!(
                "Query {query_id} is reserving {bytes} bytes, more than the maximum of {} bytes per query",
                self.max_bytes_per_query
            )));
        }

        loop {
            let entry = self.budget(query_id);
            let mut budget = entry.lock();
            if budget.retired {
                continue;
            }
            if budget.used().checked_add(bytes).is_none() {
                return Err(Error::Memory(format!(
                    "Reserved bytes of query {query_id} overflowed"
                )));
            }
            self.total_reserved.fetch_add(bytes, Ordering::AcqRel);

            let fits = budget.granted.saturating_add(bytes) <= self.max_bytes_per_query;
            let blocked = if budget.waiters.is_empty() && fits {
                budget.granted += bytes;
                Blocked::ready()
            } else {
                let (signal, blocked) = Blocked::waiting();
                budget.waiters.push_back(Waiter {
                    id,
                    remaining: bytes,
                    signal,
                });
                budget.waiting_bytes += bytes;
                debug!(%query_id, reservation = %id, bytes, used = budget.used(), "Query is over its memory budget, reservation is waiting");
                blocked
            };

            self.record_metrics(query_id, &budget);
            return Ok(Reservation { id, blocked });
        }
    }

    /// Releases `bytes` of the query and grants the waiters which fit now. Freeing more than is
    /// reserved is a bug in the caller and is reported as an error, the usage is left untouched.
    pub fn free(&self, query_id: &QueryId, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let Some(budget) = self.existing_budget(query_id) else {
            error!(%query_id, bytes, "Freeing memory of a query that never reserved any");
            return Err(Error::Memory(format!(
                "Query {query_id} has no reserved memory, cannot free {bytes} bytes"
            )));
        };

        {
            let mut budget = budget.lock();
            if bytes > budget.used() {
                error!(%query_id, bytes, used = budget.used(), "Freeing more memory than reserved");
                return Err(Error::Memory(format!(
                    "Query {query_id} is freeing {bytes} bytes, but only {} bytes are reserved",
                    budget.used()
                )));
            }
            budget.release(bytes);
            self.total_reserved.fetch_sub(bytes, Ordering::AcqRel);
            budget.grant_waiters(self.max_bytes_per_query);
            self.record_metrics(query_id, &budget);
            if !budget.is_idle() {
                return Ok(());
            }
        }

        self.retire_if_idle(query_id);
        Ok(())
    }

    /// Drops the entry of a query which holds no memory anymore, along with its metrics. The
    /// pool lock is taken before the query's lock, like everywhere else, so a concurrent
    /// reservation either lands before the check or on a new entry.
    fn retire_if_idle(&self, query_id: &QueryId) {
        let mut queries = self.queries.lock();
        let Some(budget) = queries.get(query_id) else {
            return;
        };
        let mut budget = budget.lock();
        if !budget.is_idle() {
            return;
        }
        budget.retired = true;
        drop(budget);
        queries.remove(query_id);

        let labels = query_metric_labels(query_id);
        let metrics = &exchange_metrics().memory;
        metrics.reserved_bytes.remove(&labels);
        metrics.waiting_reservations.remove(&labels);
        debug!(%query_id, "Query released all of its memory");
    }

    /// Withdraws a reservation that is still waiting. The bytes stay accounted (they belong to
    /// buffered blocks and must still be freed), only the waiter is dropped and its signal
    /// resolves as cancelled. Returns false if the reservation was not waiting.
    pub fn cancel(&self, query_id: &QueryId, id: ReservationId) -> bool {
        let Some(budget) = self.existing_budget(query_id) else {
            return false;
        };
        let mut budget = budget.lock();
        let Some(position) = budget.waiters.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        let Some(waiter) = budget.waiters.remove(position) else {
            return false;
        };
        // the bytes belong to buffered blocks and are released by their owner
        budget.waiting_bytes -= waiter.remaining;
        budget.granted += waiter.remaining;
        waiter.signal.send_replace(ReservationState::Cancelled);
        debug!(%query_id, reservation = %id, "Memory reservation cancelled");

        budget.grant_waiters(self.max_bytes_per_query);
        self.record_metrics(query_id, &budget);
        true
    }

    /// Number of queries holding memory or waiting for it.
    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Bytes currently accounted to the query, waiting reservations included.
    pub fn reserved_bytes(&self, query_id: &QueryId) -> u64 {
        self.existing_budget(query_id).map_or(0, |budget| {
            let budget = budget.lock();
            budget.used()
        })
    }

    pub fn waiting_reservations(&self, query_id: &QueryId) -> usize {
        self.existing_budget(query_id).map_or(0, |budget| {
            let budget = budget.lock();
            budget.waiters.len()
        })
    }

    pub fn total_reserved_bytes(&self) -> u64 {
        self.total_reserved.load(Ordering::Acquire)
    }

    fn record_metrics(&self, query_id: &QueryId, budget: &QueryBudget) {
        let labels = query_metric_labels(query_id);
        let metrics = &exchange_metrics().memory;
        metrics
            .reserved_bytes
            .get_or_create(&labels)
            .set(i64::try_from(budget.used()).unwrap_or(i64::MAX));
        metrics
            .waiting_reservations
            .get_or_create(&labels)
            .set(budget.waiters.len() as i64);
    }
}
