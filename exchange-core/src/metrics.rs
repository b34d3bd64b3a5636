use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::Result;
use crate::error::Error;
use crate::ids::{ExchangeEdge, QueryId};

// labels
const QUERY_ID_LABEL: &str = "query_id";
const FRAGMENT_INSTANCE_LABEL: &str = "fragment_instance";
const REMOTE_ENDPOINT_LABEL: &str = "remote_endpoint";

// registry prefixes
const EXCHANGE_REGISTRY_GLOBAL_PREFIX: &str = "exchange";
const SINK_REGISTRY_PREFIX: &str = "sink";
const MEMORY_POOL_REGISTRY_PREFIX: &str = "memory_pool";

// Note: counters get the `_total` suffix from the prometheus client library.
const BUFFERED_BYTES: &str = "buffered_bytes";
const BUFFERED_BLOCKS: &str = "buffered_blocks";
const NEW_DATA_EVENTS: &str = "new_data_events";
const DELIVERY_RETRIES: &str = "delivery_retries";
const DELIVERY_FAILURES: &str = "delivery_failures";
const RESERVED_BYTES: &str = "reserved_bytes";
const WAITING_RESERVATIONS: &str = "waiting_reservations";

type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(
                EXCHANGE_REGISTRY_GLOBAL_PREFIX,
            )),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the sink handles, labelled per exchange edge.
pub(crate) struct SinkMetrics {
    pub(crate) buffered_bytes: Family<Labels, Gauge>,
    pub(crate) buffered_blocks: Family<Labels, Gauge>,
    pub(crate) new_data_events: Family<Labels, Counter>,
    pub(crate) delivery_retries: Family<Labels, Counter>,
    pub(crate) delivery_failures: Family<Labels, Counter>,
}

/// Metrics of the memory pool, labelled per query.
pub(crate) struct MemoryPoolMetrics {
    pub(crate) reserved_bytes: Family<Labels, Gauge>,
    pub(crate) waiting_reservations: Family<Labels, Gauge>,
}

pub(crate) struct ExchangeMetrics {
    pub(crate) sink: SinkMetrics,
    pub(crate) memory: MemoryPoolMetrics,
}

impl ExchangeMetrics {
    fn new() -> Self {
        let metrics = Self {
            sink: SinkMetrics {
                buffered_bytes: Family::<Labels, Gauge>::default(),
                buffered_blocks: Family::<Labels, Gauge>::default(),
                new_data_events: Family::<Labels, Counter>::default(),
                delivery_retries: Family::<Labels, Counter>::default(),
                delivery_failures: Family::<Labels, Counter>::default(),
            },
            memory: MemoryPoolMetrics {
                reserved_bytes: Family::<Labels, Gauge>::default(),
                waiting_reservations: Family::<Labels, Gauge>::default(),
            },
        };

        let mut registry = global_registry().registry.lock();
        let sink_registry = registry.sub_registry_with_prefix(SINK_REGISTRY_PREFIX);
        sink_registry.register(
            BUFFERED_BYTES,
            "Retained bytes of the blocks buffered and not yet acknowledged",
            metrics.sink.buffered_bytes.clone(),
        );
        sink_registry.register(
            BUFFERED_BLOCKS,
            "Number of blocks buffered and not yet acknowledged",
            metrics.sink.buffered_blocks.clone(),
        );
        sink_registry.register(
            NEW_DATA_EVENTS,
            "A Counter to keep track of the new data block events delivered to the consumer",
            metrics.sink.new_data_events.clone(),
        );
        sink_registry.register(
            DELIVERY_RETRIES,
            "A Counter to keep track of the failed delivery attempts which were retried",
            metrics.sink.delivery_retries.clone(),
        );
        sink_registry.register(
            DELIVERY_FAILURES,
            "A Counter to keep track of the deliveries which exhausted all attempts",
            metrics.sink.delivery_failures.clone(),
        );

        let memory_registry = registry.sub_registry_with_prefix(MEMORY_POOL_REGISTRY_PREFIX);
        memory_registry.register(
            RESERVED_BYTES,
            "Bytes reserved by the query, waiting reservations included",
            metrics.memory.reserved_bytes.clone(),
        );
        memory_registry.register(
            WAITING_RESERVATIONS,
            "Number of reservations waiting for the query to get back within its budget",
            metrics.memory.waiting_reservations.clone(),
        );
        metrics
    }
}

static EXCHANGE_METRICS: OnceLock<ExchangeMetrics> = OnceLock::new();

pub(crate) fn exchange_metrics() -> &'static ExchangeMetrics {
    EXCHANGE_METRICS.get_or_init(ExchangeMetrics::new)
}

pub(crate) fn sink_metric_labels(edge: &ExchangeEdge) -> Labels {
    vec![
        (QUERY_ID_LABEL.to_string(), edge.query_id().to_string()),
        (
            FRAGMENT_INSTANCE_LABEL.to_string(),
            edge.local_fragment_instance_id.to_string(),
        ),
        (
            REMOTE_ENDPOINT_LABEL.to_string(),
            edge.remote_endpoint.to_string(),
        ),
    ]
}

/// Drops the series of a sink handle which reached a terminal state.
pub(crate) fn remove_sink_metrics(labels: &Labels) {
    let metrics = &exchange_metrics().sink;
    metrics.buffered_bytes.remove(labels);
    metrics.buffered_blocks.remove(labels);
    metrics.new_data_events.remove(labels);
    metrics.delivery_retries.remove(labels);
    metrics.delivery_failures.remove(labels);
}

pub(crate) fn query_metric_labels(query_id: &QueryId) -> Labels {
    vec![(QUERY_ID_LABEL.to_string(), query_id.to_string())]
}

/// Snapshot of all the exchange metrics in the prometheus text format.
pub fn metrics_text() -> Result<String> {
    // make sure the metrics are registered even if nothing recorded yet
    let _ = exchange_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Metrics(format!("Failed to encode metrics: {e}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_text() {
        let labels = query_metric_labels(&QueryId::new("metrics-query"));
        exchange_metrics()
            .memory
            .reserved_bytes
            .get_or_create(&labels)
            .set(42);

        let text = metrics_text().unwrap();
        assert!(text.contains("exchange_memory_pool_reserved_bytes"));
        assert!(text.contains("metrics-query"));
        assert!(text.contains("exchange_sink_delivery_failures"));
    }
}
