pub mod memory;
pub mod neo4j;

use crate::prelude::*;

use crate::base::value::Value;
use crate::graph::model::NodeMatch;
use std::fmt;

/// Opaque reference to a graph node, valid for the lifetime of the
/// conversion run. Backed by element ids for the network client and by
/// numeric ids for the in-memory client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub String);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of a bulk node MERGE: matched on the primary key value, then
/// properties set and extra labels added.
#[derive(Debug, Clone)]
pub struct MergeNodeRow {
    pub key: Value,
    pub properties: IndexMap<String, Value>,
    pub extra_labels: Vec<String>,
}

/// One row of a bulk relationship MERGE/CREATE between resolved endpoints.
#[derive(Debug, Clone)]
pub struct RelRow {
    pub start: NodeHandle,
    pub end: NodeHandle,
    /// Primary key value for merged relationships; `None` for created ones.
    pub key: Option<Value>,
    pub properties: IndexMap<String, Value>,
}

/// The operations a batch translates into: all node operations are issued
/// before any relationship operation, inside one transaction.
#[async_trait]
pub trait GraphTransaction: Send {
    /// Bulk MERGE on `(primary_label, key_name)`, then SET properties and
    /// extra labels. Returns one handle per row, in row order.
    async fn merge_nodes(
        &mut self,
        primary_label: &str,
        key_name: &str,
        rows: Vec<MergeNodeRow>,
    ) -> Result<Vec<NodeHandle>>;

    /// Bulk CREATE of unconditioned nodes. Returns one handle per row.
    async fn create_nodes(
        &mut self,
        labels: &[String],
        rows: Vec<IndexMap<String, Value>>,
    ) -> Result<Vec<NodeHandle>>;

    /// All existing nodes carrying every label and every condition.
    async fn match_nodes(&mut self, pattern: &NodeMatch) -> Result<Vec<NodeHandle>>;

    /// Bulk MERGE on `(endpoints, rel_type, key_name)`, then SET properties.
    async fn merge_relationships(
        &mut self,
        rel_type: &str,
        key_name: &str,
        rows: Vec<RelRow>,
    ) -> Result<()>;

    /// Bulk CREATE; parallel edges are intentional.
    async fn create_relationships(&mut self, rel_type: &str, rows: Vec<RelRow>) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A connection to a graph database able to open transactions. The engine
/// publishes its client under the `graph_driver` shared-state slot so
/// wrapper code can issue ad-hoc queries.
#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>>;
}
