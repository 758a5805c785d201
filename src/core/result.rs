use crate::core::node::NodeId;
use serde::{Deserialize, Serialize};

/// One result row: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Outcome of a query as reported back to the client, including which node
/// executed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Vec<Row>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub rows_affected: Option<u64>,
}

impl QueryResult {
    pub fn failure(error: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            node_id: Some(node_id),
            execution_time: None,
            rows_affected: None,
        }
    }
}
