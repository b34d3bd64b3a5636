//! Identities of the parties taking part in a data exchange.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Query the fragment instances belong to. Memory is accounted per query.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One runnable piece of a distributed plan, executing on a specific node.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FragmentInstanceId {
    pub query_id: QueryId,
    pub fragment_id: u32,
    pub instance_id: String,
}

impl FragmentInstanceId {
    pub fn new(query_id: QueryId, fragment_id: u32, instance_id: impl Into<String>) -> Self {
        Self {
            query_id,
            fragment_id,
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for FragmentInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.query_id, self.fragment_id, self.instance_id
        )
    }
}

/// Plan node consuming the blocks on the remote fragment instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a data node.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// ExchangeEdge identifies the channel between a producing fragment instance and the plan node
/// consuming its output on a remote fragment instance. It never changes for the lifetime of a
/// sink handle.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ExchangeEdge {
    pub remote_endpoint: Endpoint,
    pub remote_fragment_instance_id: FragmentInstanceId,
    pub remote_plan_node_id: PlanNodeId,
    pub local_fragment_instance_id: FragmentInstanceId,
}

impl ExchangeEdge {
    /// Query whose memory budget backs the blocks sent over this edge.
    pub fn query_id(&self) -> &QueryId {
        &self.local_fragment_instance_id.query_id
    }
}

impl fmt::Display for ExchangeEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SinkHandle[remoteEndpoint='{}', remoteFragmentInstanceId={}, remotePlanNodeId='{}', localFragmentInstanceId={}]",
            self.remote_endpoint,
            self.remote_fragment_instance_id,
            self.remote_plan_node_id,
            self.local_fragment_instance_id
        )
    }
}
