use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::Result;
use crate::client::{ClientError, ClientManager, PooledClient};
use crate::config::SinkHandleConfig;
use crate::error::Error;
use crate::event::{DataBlockEvent, EndOfDataBlockEvent, NewDataBlockEvent};
use crate::ids::ExchangeEdge;
use crate::metrics::{exchange_metrics, sink_metric_labels};

/// Deliverer pushes the sink handle's events to the consumer, retrying failed attempts with a
/// freshly borrowed client each time.
pub(crate) struct Deliverer<M> {
    edge: Arc<ExchangeEdge>,
    client_manager: Arc<M>,
    max_attempt_times: u16,
    retry_interval: Duration,
    metric_labels: Arc<Vec<(String, String)>>,
}

impl<M> Clone for Deliverer<M> {
    fn clone(&self) -> Self {
        Self {
            edge: Arc::clone(&self.edge),
            client_manager: Arc::clone(&self.client_manager),
            max_attempt_times: self.max_attempt_times,
            retry_interval: self.retry_interval,
            metric_labels: Arc::clone(&self.metric_labels),
        }
    }
}

impl<M> Deliverer<M>
where
    M: ClientManager + Send + Sync + 'static,
{
    pub(crate) fn new(
        edge: Arc<ExchangeEdge>,
        client_manager: Arc<M>,
        config: &SinkHandleConfig,
    ) -> Self {
        let metric_labels = Arc::new(sink_metric_labels(&edge));
        Self {
            edge,
            client_manager,
            // at least the first attempt is always made
            max_attempt_times: config.max_attempt_times.max(1),
            retry_interval: config.retry_interval,
            metric_labels,
        }
    }

    pub(crate) fn new_data_block_event(
        &self,
        start_sequence_id: u64,
        block_sizes: Vec<u64>,
    ) -> NewDataBlockEvent {
        NewDataBlockEvent {
            target_fragment_instance_id: self.edge.remote_fragment_instance_id.clone(),
            target_plan_node_id: self.edge.remote_plan_node_id.clone(),
            source_fragment_instance_id: self.edge.local_fragment_instance_id.clone(),
            start_sequence_id,
            block_sizes,
        }
    }

    pub(crate) fn end_of_data_block_event(
        &self,
        last_sequence_id: Option<u64>,
    ) -> EndOfDataBlockEvent {
        EndOfDataBlockEvent {
            target_fragment_instance_id: self.edge.remote_fragment_instance_id.clone(),
            target_plan_node_id: self.edge.remote_plan_node_id.clone(),
            source_fragment_instance_id: self.edge.local_fragment_instance_id.clone(),
            last_sequence_id,
        }
    }

    /// Delivers the event, making at most `max_attempt_times` attempts. Returns the error of the
    /// last attempt once all of them failed.
    pub(crate) async fn deliver(&self, event: DataBlockEvent) -> Result<()> {
        let metrics = &exchange_metrics().sink;
        let mut attempt: u16 = 0;
        loop {
            attempt += 1;
            debug!(edge = %self.edge, attempt, "Sending {} event", event.kind());

            let err = match self.attempt(&event).await {
                Ok(()) => {
                    if let DataBlockEvent::NewData(_) = event {
                        metrics.new_data_events.get_or_create(&self.metric_labels).inc();
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            error!(
                edge = %self.edge,
                attempt,
                error = %err,
                "Failed to send {} event",
                event.kind()
            );
            if attempt >= self.max_attempt_times {
                metrics
                    .delivery_failures
                    .get_or_create(&self.metric_labels)
                    .inc();
                return Err(Error::Delivery(format!(
                    "Failed to send {} event to {} after {attempt} attempts: {err}",
                    event.kind(),
                    self.edge.remote_endpoint
                )));
            }

            metrics
                .delivery_retries
                .get_or_create(&self.metric_labels)
                .inc();
            if !self.retry_interval.is_zero() {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
    }

    /// One attempt, on a client borrowed for this attempt only. The client is closed before it
    /// is returned if the failure left it unusable.
    async fn attempt(&self, event: &DataBlockEvent) -> std::result::Result<(), ClientError> {
        let endpoint = &self.edge.remote_endpoint;
        let Some(client) = self.client_manager.borrow_client(endpoint).await? else {
            warn!(%endpoint, "Can't get client for node");
            return Err(ClientError::Unavailable(endpoint.clone()));
        };

        let mut client = PooledClient::new(client);
        let result = client.send(event).await;
        if result.as_ref().is_err_and(ClientError::discards_client) {
            client.close();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestClientManager, test_edge};

    fn deliverer(manager: &TestClientManager, max_attempt_times: u16) -> Deliverer<TestClientManager> {
        let config = SinkHandleConfig {
            max_attempt_times,
            ..Default::default()
        };
        Deliverer::new(Arc::new(test_edge("delivery")), Arc::new(manager.clone()), &config)
    }

    #[tokio::test]
    async fn test_deliver_first_attempt() {
        let manager = TestClientManager::default();
        let deliverer = deliverer(&manager, 3);

        let event = deliverer.new_data_block_event(0, vec![10, 20]);
        deliverer
            .deliver(DataBlockEvent::NewData(event.clone()))
            .await
            .unwrap();

        assert_eq!(manager.events(), vec![DataBlockEvent::NewData(event)]);
        assert_eq!(manager.borrowed(), 1);
        assert_eq!(manager.returned(), 1);
        assert_eq!(manager.closed(), 0);
    }

    #[tokio::test]
    async fn test_deliver_retries_with_new_client() {
        let manager = TestClientManager::default();
        manager.injector().fail_transport(2);
        let deliverer = deliverer(&manager, 3);

        let event = deliverer.end_of_data_block_event(Some(4));
        deliverer
            .deliver(DataBlockEvent::EndOfData(event))
            .await
            .unwrap();

        assert_eq!(manager.events().len(), 1);
        assert_eq!(manager.borrowed(), 3);
        assert_eq!(manager.returned(), 3);
        // transport failures keep the client usable
        assert_eq!(manager.closed(), 0);
    }

    #[tokio::test]
    async fn test_deliver_protocol_error_closes_client() {
        let manager = TestClientManager::default();
        manager.injector().fail_protocol(1);
        let deliverer = deliverer(&manager, 3);

        let event = deliverer.new_data_block_event(0, vec![1]);
        deliverer
            .deliver(DataBlockEvent::NewData(event))
            .await
            .unwrap();

        assert_eq!(manager.borrowed(), 2);
        assert_eq!(manager.returned(), 2);
        assert_eq!(manager.closed(), 1);
    }

    #[tokio::test]
    async fn test_deliver_gives_up() {
        let manager = TestClientManager::default();
        manager.injector().fail_transport(10);
        let deliverer = deliverer(&manager, 3);

        let event = deliverer.new_data_block_event(0, vec![1]);
        let result = deliverer.deliver(DataBlockEvent::NewData(event)).await;

        assert!(matches!(result, Err(Error::Delivery(_))));
        assert!(manager.events().is_empty());
        assert_eq!(manager.borrowed(), 3);
        assert_eq!(manager.returned(), 3);
    }

    #[tokio::test]
    async fn test_deliver_without_client() {
        let manager = TestClientManager::default();
        manager.injector().fail_borrow(1);
        manager.injector().fail_connect(1);
        let deliverer = deliverer(&manager, 3);

        let event = deliverer.new_data_block_event(0, vec![1]);
        deliverer
            .deliver(DataBlockEvent::NewData(event))
            .await
            .unwrap();

        // only the third attempt got a client
        assert_eq!(manager.borrowed(), 1);
        assert_eq!(manager.returned(), 1);
        assert_eq!(manager.events().len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_zero_attempts_still_tries_once() {
        let manager = TestClientManager::default();
        let deliverer = deliverer(&manager, 0);

        let event = deliverer.new_data_block_event(0, vec![1]);
        deliverer
            .deliver(DataBlockEvent::NewData(event))
            .await
            .unwrap();
        assert_eq!(manager.events().len(), 1);
    }
}
