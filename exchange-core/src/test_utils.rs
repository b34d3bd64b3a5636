//! In-process doubles of the client pool and the fragment driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::block::RawBlock;
use crate::client::{ClientError, ClientManager, DataBlockServiceClient};
use crate::error::Error;
use crate::event::{DataBlockEvent, EndOfDataBlockEvent, NewDataBlockEvent};
use crate::ids::{Endpoint, ExchangeEdge, FragmentInstanceId, PlanNodeId, QueryId};
use crate::sink::SinkHandleListener;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_edge(query: &str) -> ExchangeEdge {
    ExchangeEdge {
        remote_endpoint: Endpoint::new("127.0.0.1", 9003),
        remote_fragment_instance_id: FragmentInstanceId::new(QueryId::new(query), 1, "0"),
        remote_plan_node_id: PlanNodeId::new("exchange-1"),
        local_fragment_instance_id: FragmentInstanceId::new(QueryId::new(query), 2, "0"),
    }
}

pub(crate) fn block(size: usize) -> RawBlock {
    RawBlock::new(vec![7u8; size])
}

/// Polls `condition` until it holds, panics after a few seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

/// Controller for injecting client failures.
#[derive(Debug, Default)]
pub(crate) struct ErrorInjector {
    /// The pool has no client for the next N borrows.
    fail_next_borrows: AtomicUsize,
    /// The next N borrows can't connect.
    fail_next_connects: AtomicUsize,
    /// The next N calls fail at the transport layer.
    fail_next_transport: AtomicUsize,
    /// The next N calls fail at the protocol layer.
    fail_next_protocol: AtomicUsize,
    /// Artificial call latency in milliseconds.
    call_latency_ms: AtomicU64,
}

impl ErrorInjector {
    pub(crate) fn fail_borrow(&self, count: usize) {
        self.fail_next_borrows.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_connect(&self, count: usize) {
        self.fail_next_connects.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_transport(&self, count: usize) {
        self.fail_next_transport.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_protocol(&self, count: usize) {
        self.fail_next_protocol.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_call_latency(&self, ms: u64) {
        self.call_latency_ms.store(ms, Ordering::Relaxed);
    }

    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    async fn apply_call_latency(&self) {
        let ms = self.call_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    injector: ErrorInjector,
    events: Mutex<Vec<DataBlockEvent>>,
    borrowed: AtomicUsize,
    returned: AtomicUsize,
    closed: AtomicUsize,
}

/// Client pool recording every delivered event.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestClientManager {
    state: Arc<PoolState>,
}

impl TestClientManager {
    pub(crate) fn injector(&self) -> &ErrorInjector {
        &self.state.injector
    }

    pub(crate) fn events(&self) -> Vec<DataBlockEvent> {
        self.state.events.lock().clone()
    }

    pub(crate) fn new_data_events(&self) -> Vec<NewDataBlockEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DataBlockEvent::NewData(event) => Some(event),
                DataBlockEvent::EndOfData(_) => None,
            })
            .collect()
    }

    pub(crate) fn end_of_data_events(&self) -> Vec<EndOfDataBlockEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DataBlockEvent::EndOfData(event) => Some(event),
                DataBlockEvent::NewData(_) => None,
            })
            .collect()
    }

    pub(crate) fn borrowed(&self) -> usize {
        self.state.borrowed.load(Ordering::SeqCst)
    }

    pub(crate) fn returned(&self) -> usize {
        self.state.returned.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl ClientManager for TestClientManager {
    type Client = TestClient;

    async fn borrow_client(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Option<Self::Client>, ClientError> {
        let injector = &self.state.injector;
        if ErrorInjector::decrement_counter(&injector.fail_next_borrows) {
            return Ok(None);
        }
        if ErrorInjector::decrement_counter(&injector.fail_next_connects) {
            return Err(ClientError::Transport(format!(
                "connection refused by {endpoint}"
            )));
        }
        self.state.borrowed.fetch_add(1, Ordering::SeqCst);
        Ok(Some(TestClient {
            state: Arc::clone(&self.state),
        }))
    }
}

pub(crate) struct TestClient {
    state: Arc<PoolState>,
}

impl TestClient {
    async fn call(&mut self, event: DataBlockEvent) -> Result<(), ClientError> {
        let injector = &self.state.injector;
        injector.apply_call_latency().await;
        if ErrorInjector::decrement_counter(&injector.fail_next_protocol) {
            return Err(ClientError::Protocol("unexpected frame".to_string()));
        }
        if ErrorInjector::decrement_counter(&injector.fail_next_transport) {
            return Err(ClientError::Transport("broken pipe".to_string()));
        }
        self.state.events.lock().push(event);
        Ok(())
    }
}

impl DataBlockServiceClient for TestClient {
    async fn on_new_data_block_event(
        &mut self,
        event: NewDataBlockEvent,
    ) -> Result<(), ClientError> {
        self.call(DataBlockEvent::NewData(event)).await
    }

    async fn on_end_of_data_block_event(
        &mut self,
        event: EndOfDataBlockEvent,
    ) -> Result<(), ClientError> {
        self.call(DataBlockEvent::EndOfData(event)).await
    }

    fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn return_self(&mut self) {
        self.state.returned.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener counting the lifecycle callbacks.
#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    pub(crate) finished: AtomicUsize,
    pub(crate) closed: AtomicUsize,
    pub(crate) aborted: AtomicUsize,
    pub(crate) failures: Mutex<Vec<Error>>,
}

impl RecordingListener {
    pub(crate) fn as_listener(self: &Arc<Self>) -> Arc<dyn SinkHandleListener> {
        let listener: Arc<RecordingListener> = Arc::clone(self);
        listener
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures.lock().len()
    }
}

impl SinkHandleListener for RecordingListener {
    fn on_finish(&self, _edge: &ExchangeEdge) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _edge: &ExchangeEdge) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_aborted(&self, _edge: &ExchangeEdge) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _edge: &ExchangeEdge, error: Error) {
        self.failures.lock().push(error);
    }
}
