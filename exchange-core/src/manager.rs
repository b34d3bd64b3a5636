//! Node wide registry of the sink handles, and the entry point of the consumers' inbound
//! acknowledgements and pull requests.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::Result;
use crate::block::DataBlock;
use crate::client::ClientManager;
use crate::config::{ExchangeConfig, SinkHandleConfig, config};
use crate::error::Error;
use crate::event::{AcknowledgeDataBlockEvent, GetDataBlockRequest};
use crate::ids::{ExchangeEdge, FragmentInstanceId};
use crate::memory::MemoryPool;
use crate::sink::{SinkHandle, SinkHandleListener};

type SinkHandles<B, M> = Mutex<HashMap<FragmentInstanceId, Arc<SinkHandle<B, M>>>>;

pub struct ExchangeManager<B, M> {
    memory_pool: Arc<MemoryPool>,
    client_manager: Arc<M>,
    config: SinkHandleConfig,
    runtime: Handle,
    sink_handles: Arc<SinkHandles<B, M>>,
}

impl<B, M> ExchangeManager<B, M>
where
    B: DataBlock,
    M: ClientManager + Send + Sync + 'static,
{
    pub fn new(
        memory_pool: Arc<MemoryPool>,
        client_manager: Arc<M>,
        config: SinkHandleConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            memory_pool,
            client_manager,
            config,
            runtime,
            sink_handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds the manager and its memory pool from the node's [ExchangeConfig].
    pub fn from_config(config: &ExchangeConfig, client_manager: Arc<M>, runtime: Handle) -> Self {
        Self::new(
            Arc::new(MemoryPool::new(&config.memory)),
            client_manager,
            config.sink.clone(),
            runtime,
        )
    }

    /// Builds the manager from the process wide configuration, see [config].
    pub fn from_process_config(client_manager: Arc<M>, runtime: Handle) -> Self {
        Self::from_config(config(), client_manager, runtime)
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    /// Creates the sink handle of the local fragment instance of `edge`. The handle is
    /// deregistered once it finishes or is aborted.
    pub fn create_sink_handle(
        &self,
        edge: ExchangeEdge,
        listener: Arc<dyn SinkHandleListener>,
    ) -> Result<Arc<SinkHandle<B, M>>> {
        let mut sink_handles = self.sink_handles.lock();
        let local_fragment_instance_id = edge.local_fragment_instance_id.clone();
        if sink_handles.contains_key(&local_fragment_instance_id) {
            return Err(Error::DuplicateHandle(local_fragment_instance_id.to_string()));
        }

        let listener = Arc::new(RegistryListener {
            sink_handles: Arc::downgrade(&self.sink_handles),
            inner: listener,
        });
        info!(%edge, "Creating sink handle");
        let handle = Arc::new(SinkHandle::new(
            edge,
            Arc::clone(&self.memory_pool),
            Arc::clone(&self.client_manager),
            listener,
            &self.config,
            self.runtime.clone(),
        ));
        sink_handles.insert(local_fragment_instance_id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn sink_handle(
        &self,
        local_fragment_instance_id: &FragmentInstanceId,
    ) -> Option<Arc<SinkHandle<B, M>>> {
        self.sink_handles
            .lock()
            .get(local_fragment_instance_id)
            .map(Arc::clone)
    }

    pub fn sink_handle_count(&self) -> usize {
        self.sink_handles.lock().len()
    }

    /// Routes an acknowledgement to its sink handle. Acknowledgements may arrive after the
    /// handle is gone, those are ignored.
    pub fn on_acknowledge_data_block_event(&self, event: AcknowledgeDataBlockEvent) -> Result<()> {
        let Some(handle) = self.sink_handle(&event.source_fragment_instance_id) else {
            debug!(
                fragment_instance = %event.source_fragment_instance_id,
                start_sequence_id = event.start_sequence_id,
                end_sequence_id = event.end_sequence_id,
                "Ignoring acknowledgement for a sink handle that doesn't exist"
            );
            return Ok(());
        };
        handle.acknowledge(event.start_sequence_id, event.end_sequence_id)
    }

    /// Serialized blocks `[start_sequence_id, end_sequence_id)` of the requested sink handle.
    pub fn get_data_block(&self, request: GetDataBlockRequest) -> Result<Vec<Bytes>> {
        let handle = self
            .sink_handle(&request.source_fragment_instance_id)
            .ok_or_else(|| Error::HandleNotFound(request.source_fragment_instance_id.to_string()))?;
        (request.start_sequence_id..request.end_sequence_id)
            .map(|sequence_id| handle.get_serialized_block(sequence_id))
            .collect()
    }

    /// Aborts and drops the sink handle of a fragment instance, e.g. when its query is
    /// cancelled. Returns false if there was none.
    pub fn force_deregister(&self, local_fragment_instance_id: &FragmentInstanceId) -> bool {
        let Some(handle) = self.sink_handles.lock().remove(local_fragment_instance_id) else {
            return false;
        };
        info!(fragment_instance = %local_fragment_instance_id, "Force deregistering sink handle");
        handle.abort();
        true
    }
}

/// Drops the handle from the registry once it reaches a terminal state, then forwards the
/// callback to the driver's listener.
struct RegistryListener<B, M> {
    sink_handles: Weak<SinkHandles<B, M>>,
    inner: Arc<dyn SinkHandleListener>,
}

impl<B, M> RegistryListener<B, M> {
    fn deregister(&self, edge: &ExchangeEdge) {
        if let Some(sink_handles) = self.sink_handles.upgrade() {
            let removed = sink_handles
                .lock()
                .remove(&edge.local_fragment_instance_id);
            if removed.is_some() {
                debug!(%edge, "Sink handle deregistered");
            }
        }
    }
}

impl<B, M> SinkHandleListener for RegistryListener<B, M>
where
    B: DataBlock,
    M: ClientManager + Send + Sync + 'static,
{
    fn on_finish(&self, edge: &ExchangeEdge) {
        self.deregister(edge);
        self.inner.on_finish(edge);
    }

    fn on_closed(&self, edge: &ExchangeEdge) {
        self.inner.on_closed(edge);
    }

    fn on_aborted(&self, edge: &ExchangeEdge) {
        self.deregister(edge);
        self.inner.on_aborted(edge);
    }

    fn on_failure(&self, edge: &ExchangeEdge, error: Error) {
        self.inner.on_failure(edge, error);
    }
}
