use crate::prelude::*;

use crate::base::value::Value;
use crate::graph::model::NodeMatch;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use tokio::sync::OwnedMutexGuard;

use super::{GraphClient, GraphTransaction, MergeNodeRow, NodeHandle, RelRow};

/// An in-process property graph implementing the full client contract.
///
/// Transactions take the graph lock for their whole lifetime and stage their
/// writes on a copy, so a rollback (or a dropped transaction) leaves the
/// graph untouched. Commit faults can be injected to exercise the engine's
/// retry and resume paths.
#[derive(Default)]
pub struct MemoryGraphClient {
    data: Arc<tokio::sync::Mutex<GraphData>>,
    next_id: Arc<AtomicU64>,
    commit_seq: Arc<AtomicU64>,
    fault_window: Mutex<Option<Range<u64>>>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphData {
    pub nodes: Vec<StoredNode>,
    pub relationships: Vec<StoredRelationship>,
}

#[derive(Debug, Clone)]
pub struct StoredNode {
    pub id: u64,
    pub labels: Vec<String>,
    pub properties: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StoredRelationship {
    pub start: u64,
    pub end: u64,
    pub rel_type: String,
    pub properties: IndexMap<String, Value>,
}

impl MemoryGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every commit whose sequence number (0-based, counting all
    /// attempts) falls within `skip..skip + count`, with a transient error.
    pub fn inject_commit_faults(&self, skip: u64, count: u64) {
        *self.fault_window.lock().unwrap() = Some(skip..skip + count);
    }

    pub fn commit_attempts(&self) -> u64 {
        self.commit_seq.load(Relaxed)
    }

    pub async fn snapshot(&self) -> GraphData {
        self.data.lock().await.clone()
    }

    pub async fn nodes_with_label(&self, label: &str) -> Vec<StoredNode> {
        self.data
            .lock()
            .await
            .nodes
            .iter()
            .filter(|n| n.labels.iter().any(|l| l == label))
            .cloned()
            .collect()
    }

    pub async fn relationships_of_type(&self, rel_type: &str) -> Vec<StoredRelationship> {
        self.data
            .lock()
            .await
            .relationships
            .iter()
            .filter(|r| r.rel_type == rel_type)
            .cloned()
            .collect()
    }
}

impl GraphData {
    pub fn node(&self, id: u64) -> Option<&StoredNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: u64) -> Option<&mut StoredNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn find_merge_target(&self, label: &str, key_name: &str, key: &Value) -> Option<u64> {
        self.nodes
            .iter()
            .find(|n| {
                n.labels.iter().any(|l| l == label) && n.properties.get(key_name) == Some(key)
            })
            .map(|n| n.id)
    }
}

#[async_trait]
impl GraphClient for MemoryGraphClient {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>> {
        let guard = self.data.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            next_id: self.next_id.clone(),
            commit_seq: self.commit_seq.clone(),
            fault_window: self.fault_window.lock().unwrap().clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<GraphData>,
    staged: GraphData,
    next_id: Arc<AtomicU64>,
    commit_seq: Arc<AtomicU64>,
    fault_window: Option<Range<u64>>,
}

impl MemoryTransaction {
    fn parse_handle(handle: &NodeHandle) -> Result<u64> {
        handle
            .0
            .parse()
            .map_err(|_| Error::Graph(anyhow::anyhow!("unknown node handle `{handle}`")))
    }

    fn ensure_node(&self, id: u64) -> Result<()> {
        if self.staged.node(id).is_none() {
            return Err(Error::Graph(anyhow::anyhow!(
                "relationship endpoint {id} does not exist"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn merge_nodes(
        &mut self,
        primary_label: &str,
        key_name: &str,
        rows: Vec<MergeNodeRow>,
    ) -> Result<Vec<NodeHandle>> {
        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            let id = match self
                .staged
                .find_merge_target(primary_label, key_name, &row.key)
            {
                Some(id) => {
                    let node = self.staged.node_mut(id).unwrap();
                    for (k, v) in row.properties {
                        node.properties.insert(k, v);
                    }
                    for label in row.extra_labels {
                        if !node.labels.contains(&label) {
                            node.labels.push(label);
                        }
                    }
                    id
                }
                None => {
                    let id = self.next_id.fetch_add(1, Relaxed);
                    let mut labels = vec![primary_label.to_string()];
                    labels.extend(row.extra_labels);
                    let mut properties = row.properties;
                    properties.insert(key_name.to_string(), row.key);
                    self.staged.nodes.push(StoredNode {
                        id,
                        labels,
                        properties,
                    });
                    id
                }
            };
            handles.push(NodeHandle(id.to_string()));
        }
        Ok(handles)
    }

    async fn create_nodes(
        &mut self,
        labels: &[String],
        rows: Vec<IndexMap<String, Value>>,
    ) -> Result<Vec<NodeHandle>> {
        let mut handles = Vec::with_capacity(rows.len());
        for properties in rows {
            let id = self.next_id.fetch_add(1, Relaxed);
            self.staged.nodes.push(StoredNode {
                id,
                labels: labels.to_vec(),
                properties,
            });
            handles.push(NodeHandle(id.to_string()));
        }
        Ok(handles)
    }

    async fn match_nodes(&mut self, pattern: &NodeMatch) -> Result<Vec<NodeHandle>> {
        Ok(self
            .staged
            .nodes
            .iter()
            .filter(|node| {
                pattern
                    .labels
                    .iter()
                    .all(|label| node.labels.iter().any(|l| l == label))
                    && pattern
                        .conditions
                        .iter()
                        .all(|(name, value)| node.properties.get(name) == Some(value))
            })
            .map(|node| NodeHandle(node.id.to_string()))
            .collect())
    }

    async fn merge_relationships(
        &mut self,
        rel_type: &str,
        key_name: &str,
        rows: Vec<RelRow>,
    ) -> Result<()> {
        for row in rows {
            let start = Self::parse_handle(&row.start)?;
            let end = Self::parse_handle(&row.end)?;
            self.ensure_node(start)?;
            self.ensure_node(end)?;
            let key = row.key.ok_or_else(|| {
                Error::Graph(anyhow::anyhow!(
                    "merge relationship `{rel_type}` without a key value"
                ))
            })?;
            let existing = self.staged.relationships.iter_mut().find(|r| {
                r.start == start
                    && r.end == end
                    && r.rel_type == rel_type
                    && r.properties.get(key_name) == Some(&key)
            });
            match existing {
                Some(rel) => {
                    for (k, v) in row.properties {
                        rel.properties.insert(k, v);
                    }
                }
                None => {
                    let mut properties = row.properties;
                    properties.insert(key_name.to_string(), key);
                    self.staged.relationships.push(StoredRelationship {
                        start,
                        end,
                        rel_type: rel_type.to_string(),
                        properties,
                    });
                }
            }
        }
        Ok(())
    }

    async fn create_relationships(&mut self, rel_type: &str, rows: Vec<RelRow>) -> Result<()> {
        for row in rows {
            let start = Self::parse_handle(&row.start)?;
            let end = Self::parse_handle(&row.end)?;
            self.ensure_node(start)?;
            self.ensure_node(end)?;
            self.staged.relationships.push(StoredRelationship {
                start,
                end,
                rel_type: rel_type.to_string(),
                properties: row.properties,
            });
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let seq = self.commit_seq.fetch_add(1, Relaxed);
        if let Some(window) = &self.fault_window {
            if window.contains(&seq) {
                return Err(Error::TransientGraph(anyhow::anyhow!(
                    "injected fault on commit #{seq}"
                )));
            }
        }
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
