//! Messages exchanged between the sink side and the consuming fragment instance.
//!
//! Only [NewDataBlockEvent] and [EndOfDataBlockEvent] originate from the sink side. The
//! acknowledgement and pull requests are inbound and are routed by the
//! [ExchangeManager](crate::manager::ExchangeManager).

use serde::{Deserialize, Serialize};

use crate::ids::{FragmentInstanceId, PlanNodeId};

/// Blocks `[start_sequence_id, start_sequence_id + block_sizes.len())` are ready to be pulled.
/// May be delivered more than once and out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataBlockEvent {
    pub target_fragment_instance_id: FragmentInstanceId,
    pub target_plan_node_id: PlanNodeId,
    pub source_fragment_instance_id: FragmentInstanceId,
    pub start_sequence_id: u64,
    pub block_sizes: Vec<u64>,
}

/// No further blocks will be produced. `last_sequence_id` is `None` if nothing was ever sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndOfDataBlockEvent {
    pub target_fragment_instance_id: FragmentInstanceId,
    pub target_plan_node_id: PlanNodeId,
    pub source_fragment_instance_id: FragmentInstanceId,
    pub last_sequence_id: Option<u64>,
}

/// The consumer has pulled blocks `[start_sequence_id, end_sequence_id)` and they may be released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeDataBlockEvent {
    pub source_fragment_instance_id: FragmentInstanceId,
    pub start_sequence_id: u64,
    pub end_sequence_id: u64,
}

/// Pull request for the serialized blocks `[start_sequence_id, end_sequence_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataBlockRequest {
    pub source_fragment_instance_id: FragmentInstanceId,
    pub start_sequence_id: u64,
    pub end_sequence_id: u64,
}

/// Unit of work of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataBlockEvent {
    NewData(NewDataBlockEvent),
    EndOfData(EndOfDataBlockEvent),
}

impl DataBlockEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            DataBlockEvent::NewData(_) => "new data block",
            DataBlockEvent::EndOfData(_) => "end of data block",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::QueryId;

    #[test]
    fn test_end_of_data_block_event_json() {
        let event = EndOfDataBlockEvent {
            target_fragment_instance_id: FragmentInstanceId::new(QueryId::new("q"), 1, "0"),
            target_plan_node_id: PlanNodeId::new("node"),
            source_fragment_instance_id: FragmentInstanceId::new(QueryId::new("q"), 2, "0"),
            last_sequence_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["last_sequence_id"].is_null());

        let decoded: EndOfDataBlockEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }
}
