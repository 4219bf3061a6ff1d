use crate::prelude::*;

use crate::base::value::Value;
use crate::client::{GraphClient, GraphTransaction, MergeNodeRow, NodeHandle, RelRow};
use crate::graph::model::{
    Endpoint, MergeIdentity, Node, NodeIdentity, NodeMatch, NodeUid, Relationship, Subgraph,
};
use crate::settings::EngineOptions;
use crate::utils::retryable;

use super::Phase;
use super::stats::ConversionStats;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::time::Duration;

/// Node handles learned over the whole run. Relationships committed in the
/// relationships phase find their endpoints here: merge targets by merge
/// identity, plain nodes by their engine-internal uid.
#[derive(Default)]
struct HandleTable {
    by_uid: Mutex<HashMap<NodeUid, NodeHandle>>,
    by_merge: Mutex<HashMap<MergeIdentity, NodeHandle>>,
}

impl HandleTable {
    fn lookup(&self, identity: &NodeIdentity) -> Option<NodeHandle> {
        match identity {
            NodeIdentity::Merge(id) => self.by_merge.lock().unwrap().get(id).cloned(),
            NodeIdentity::Uid(uid) => self.by_uid.lock().unwrap().get(uid).cloned(),
        }
    }

    fn absorb(&self, staged: StagedHandles) {
        self.by_uid.lock().unwrap().extend(staged.by_uid);
        self.by_merge.lock().unwrap().extend(staged.by_merge);
    }

    fn clear(&self) {
        self.by_uid.lock().unwrap().clear();
        self.by_merge.lock().unwrap().clear();
    }
}

/// Handles learned inside one transaction attempt. Flushed into the run
/// table only after the commit succeeds, so a rolled-back attempt leaves no
/// stale entries behind.
#[derive(Default)]
struct StagedHandles {
    by_uid: HashMap<NodeUid, NodeHandle>,
    by_merge: HashMap<MergeIdentity, NodeHandle>,
}

impl StagedHandles {
    fn lookup(&self, identity: &NodeIdentity) -> Option<NodeHandle> {
        match identity {
            NodeIdentity::Merge(id) => self.by_merge.get(id).cloned(),
            NodeIdentity::Uid(uid) => self.by_uid.get(uid).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub nodes: usize,
    pub relationships: usize,
}

/// Translates batches of subgraphs into graph operations: one transaction
/// per batch, nodes before relationships, merge groups deduplicated, match
/// patterns resolved once each.
pub struct GraphWriter {
    client: Arc<dyn GraphClient>,
    handles: HandleTable,
    /// Single-entry commit slot: transactions to the database are
    /// serialized even when workers build batches in parallel.
    commit_slot: tokio::sync::Mutex<()>,
    retry: retryable::RetryOptions,
    timeout: Duration,
    stats: Arc<ConversionStats>,
}

impl GraphWriter {
    pub fn new(
        client: Arc<dyn GraphClient>,
        options: &EngineOptions,
        stats: Arc<ConversionStats>,
    ) -> Self {
        Self {
            client,
            handles: HandleTable::default(),
            commit_slot: tokio::sync::Mutex::new(()),
            retry: options.retry_options(),
            timeout: options.transaction_timeout,
            stats,
        }
    }

    /// Forget all learned handles; used when the checkpoint is cleared.
    pub fn clear_handles(&self) {
        self.handles.clear();
    }

    /// Commit one batch. Retries transient failures with backoff; the whole
    /// batch rolls back on every failed attempt.
    pub async fn write_batch(
        &self,
        phase: Phase,
        batch_index: usize,
        subgraphs: Vec<Subgraph>,
    ) -> Result<BatchOutcome> {
        let mut consolidated = Subgraph::default();
        for subgraph in subgraphs {
            consolidated.union(subgraph);
        }
        if consolidated.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let _slot = self.commit_slot.lock().await;
        let attempts = AtomicU32::new(0);
        let outcome = retryable::run(
            || async {
                if attempts.fetch_add(1, Relaxed) > 0 {
                    self.stats.batches_retried.inc(1);
                }
                tokio::time::timeout(self.timeout, self.apply_once(&consolidated))
                    .await
                    .map_err(|_| {
                        Error::TransientGraph(anyhow::anyhow!(
                            "transaction for batch {batch_index} timed out"
                        ))
                    })?
            },
            &self.retry,
        )
        .await?;
        debug!(
            phase = %phase,
            batch_index,
            nodes = outcome.nodes,
            relationships = outcome.relationships,
            "batch committed"
        );
        Ok(outcome)
    }

    async fn apply_once(&self, subgraph: &Subgraph) -> Result<BatchOutcome> {
        let mut txn = self.client.begin().await?;
        match self.apply_operations(&mut *txn, subgraph).await {
            Ok((staged, outcome)) => {
                txn.commit().await?;
                self.handles.absorb(staged);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    debug!(error = %rollback_err, "rollback after failed batch also failed");
                }
                Err(err)
            }
        }
    }

    async fn apply_operations(
        &self,
        txn: &mut dyn GraphTransaction,
        subgraph: &Subgraph,
    ) -> Result<(StagedHandles, BatchOutcome)> {
        let mut staged = StagedHandles::default();
        let mut outcome = BatchOutcome::default();

        // Pass 1: nodes. The batch's own nodes, plus merge-target endpoint
        // nodes carried by relationships whose handle is not yet known.
        let mut merge_groups: IndexMap<(String, String), Vec<Node>> = IndexMap::new();
        let mut create_groups: IndexMap<Vec<String>, Vec<Node>> = IndexMap::new();
        let mut grouped: HashSet<NodeIdentity> = HashSet::new();

        for node in &subgraph.nodes {
            grouped.insert(node.identity());
            match node.merge_identity() {
                Some(id) => merge_groups
                    .entry((id.label, id.key_name))
                    .or_default()
                    .push(node.clone()),
                None => create_groups
                    .entry(node.labels.clone())
                    .or_default()
                    .push(node.clone()),
            }
        }
        for rel in &subgraph.relationships {
            for endpoint in [&rel.start, &rel.end] {
                let Endpoint::Node(node) = endpoint else {
                    continue;
                };
                let Some(id) = node.merge_identity() else {
                    continue;
                };
                let identity = node.identity();
                if grouped.contains(&identity) || self.handles.lookup(&identity).is_some() {
                    continue;
                }
                grouped.insert(identity);
                merge_groups
                    .entry((id.label, id.key_name))
                    .or_default()
                    .push(node.clone());
            }
        }

        for ((label, key_name), nodes) in merge_groups {
            let rows = nodes
                .iter()
                .map(|node| MergeNodeRow {
                    key: node.primary_key_value.clone().expect("merge node has key"),
                    properties: node.properties.clone(),
                    extra_labels: node.extra_labels(),
                })
                .collect();
            let handles = txn.merge_nodes(&label, &key_name, rows).await?;
            outcome.nodes += handles.len();
            for (node, handle) in nodes.iter().zip(handles) {
                if let Some(id) = node.merge_identity() {
                    staged.by_merge.insert(id, handle.clone());
                }
                staged.by_uid.insert(node.uid, handle);
            }
        }
        for (labels, nodes) in create_groups {
            let rows = nodes.iter().map(|node| node.properties.clone()).collect();
            let handles = txn.create_nodes(&labels, rows).await?;
            outcome.nodes += handles.len();
            for (node, handle) in nodes.iter().zip(handles) {
                staged.by_uid.insert(node.uid, handle);
            }
        }

        // Pass 2: resolve each distinct match pattern once.
        let mut match_handles: HashMap<NodeMatch, Vec<NodeHandle>> = HashMap::new();
        for rel in &subgraph.relationships {
            for endpoint in [&rel.start, &rel.end] {
                if let Endpoint::Match(pattern) = endpoint {
                    if !match_handles.contains_key(pattern) {
                        let found = txn.match_nodes(pattern).await?;
                        match_handles.insert(pattern.clone(), found);
                    }
                }
            }
        }

        // Passes 3 and 4: resolve endpoints (cartesian product with matcher
        // results), then group and deduplicate relationships.
        let mut merge_rel_groups: IndexMap<
            (String, String),
            IndexMap<(NodeHandle, NodeHandle, Value), RelRow>,
        > = IndexMap::new();
        let mut create_rel_groups: IndexMap<String, Vec<RelRow>> = IndexMap::new();

        for rel in &subgraph.relationships {
            let starts = self.resolve_endpoint(&rel.start, &staged, &match_handles, rel);
            let ends = self.resolve_endpoint(&rel.end, &staged, &match_handles, rel);
            for start in &starts {
                for end in &ends {
                    if rel.merge {
                        let key_name = rel
                            .primary_key_name
                            .clone()
                            .expect("merge relationship has key name");
                        let key_value = rel
                            .primary_key_value
                            .clone()
                            .expect("merge relationship has key value");
                        let group = merge_rel_groups
                            .entry((rel.rel_type.clone(), key_name))
                            .or_default();
                        let dedup_key = (start.clone(), end.clone(), key_value.clone());
                        match group.get_mut(&dedup_key) {
                            Some(existing) => {
                                for (k, v) in &rel.properties {
                                    existing.properties.insert(k.clone(), v.clone());
                                }
                            }
                            None => {
                                group.insert(
                                    dedup_key,
                                    RelRow {
                                        start: start.clone(),
                                        end: end.clone(),
                                        key: Some(key_value),
                                        properties: rel.properties.clone(),
                                    },
                                );
                            }
                        }
                    } else {
                        create_rel_groups
                            .entry(rel.rel_type.clone())
                            .or_default()
                            .push(RelRow {
                                start: start.clone(),
                                end: end.clone(),
                                key: None,
                                properties: rel.properties.clone(),
                            });
                    }
                }
            }
        }

        for ((rel_type, key_name), group) in merge_rel_groups {
            let rows: Vec<RelRow> = group.into_values().collect();
            outcome.relationships += rows.len();
            txn.merge_relationships(&rel_type, &key_name, rows).await?;
        }
        for (rel_type, rows) in create_rel_groups {
            outcome.relationships += rows.len();
            txn.create_relationships(&rel_type, rows).await?;
        }

        Ok((staged, outcome))
    }

    /// All handles an endpoint stands for: one for a constructed node, any
    /// number for a matcher. An unresolvable endpoint yields none, dropping
    /// the relationship.
    fn resolve_endpoint(
        &self,
        endpoint: &Endpoint,
        staged: &StagedHandles,
        match_handles: &HashMap<NodeMatch, Vec<NodeHandle>>,
        rel: &Relationship,
    ) -> Vec<NodeHandle> {
        match endpoint {
            Endpoint::Node(node) => {
                let identity = node.identity();
                match staged
                    .lookup(&identity)
                    .or_else(|| self.handles.lookup(&identity))
                {
                    Some(handle) => vec![handle],
                    None => {
                        warn!(
                            rel_type = %rel.rel_type,
                            node = %node,
                            "endpoint node has no known handle, dropping relationship"
                        );
                        Vec::new()
                    }
                }
            }
            Endpoint::Match(pattern) => match_handles.get(pattern).cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryGraphClient;
    use crate::graph::model::NodeUid;

    fn writer(client: &Arc<MemoryGraphClient>) -> GraphWriter {
        let options = EngineOptions {
            retry_max: 2,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        GraphWriter::new(
            client.clone() as Arc<dyn GraphClient>,
            &options,
            Arc::new(ConversionStats::default()),
        )
    }

    fn uid(ordinal: u64, idx: u32) -> NodeUid {
        NodeUid {
            resource_ordinal: ordinal,
            subplan_idx: idx,
        }
    }

    fn merge_node(label: &str, key: &str, value: &str, ordinal: u64) -> Node {
        let mut properties = IndexMap::new();
        properties.insert(key.to_string(), Value::Str(value.to_string()));
        Node {
            labels: vec![label.to_string()],
            properties,
            primary_label: Some(label.to_string()),
            primary_key_name: Some(key.to_string()),
            primary_key_value: Some(Value::Str(value.to_string())),
            merge: true,
            uid: uid(ordinal, 0),
        }
    }

    fn plain_node(label: &str, ordinal: u64) -> Node {
        Node {
            labels: vec![label.to_string()],
            properties: IndexMap::new(),
            primary_label: None,
            primary_key_name: None,
            primary_key_value: None,
            merge: false,
            uid: uid(ordinal, 0),
        }
    }

    #[tokio::test]
    async fn nodes_deduplicate_within_a_batch() {
        let client = Arc::new(MemoryGraphClient::new());
        let writer = writer(&client);
        let subgraphs = vec![
            Subgraph::from_node(merge_node("Species", "Name", "setosa", 0)),
            Subgraph::from_node(merge_node("Species", "Name", "setosa", 1)),
            Subgraph::from_node(merge_node("Species", "Name", "versicolor", 2)),
        ];
        let outcome = writer
            .write_batch(Phase::Nodes, 0, subgraphs)
            .await
            .unwrap();
        assert_eq!(outcome.nodes, 2);
        assert_eq!(client.nodes_with_label("Species").await.len(), 2);
    }

    #[tokio::test]
    async fn relationship_endpoints_resolve_across_batches() {
        let client = Arc::new(MemoryGraphClient::new());
        let writer = writer(&client);

        // Nodes phase: a plain node and a merge node in separate batches.
        writer
            .write_batch(Phase::Nodes, 0, vec![Subgraph::from_node(plain_node("Flower", 0))])
            .await
            .unwrap();
        writer
            .write_batch(
                Phase::Nodes,
                1,
                vec![Subgraph::from_node(merge_node("Species", "Name", "setosa", 1))],
            )
            .await
            .unwrap();

        // Relationships phase: endpoints are rebuilt node values carrying the
        // same uids.
        let rel = Relationship {
            start: Endpoint::Node(plain_node("Flower", 0)),
            end: Endpoint::Node(merge_node("Species", "Name", "setosa", 1)),
            rel_type: "is".into(),
            properties: IndexMap::new(),
            primary_key_name: None,
            primary_key_value: None,
            merge: false,
        };
        let outcome = writer
            .write_batch(
                Phase::Relationships,
                0,
                vec![Subgraph::from_relationships(vec![rel])],
            )
            .await
            .unwrap();
        assert_eq!(outcome.relationships, 1);

        let rels = client.relationships_of_type("is").await;
        assert_eq!(rels.len(), 1);
        // No duplicate flower or species node was created on the way.
        assert_eq!(client.nodes_with_label("Flower").await.len(), 1);
        assert_eq!(client.nodes_with_label("Species").await.len(), 1);
    }

    #[tokio::test]
    async fn matcher_with_no_hits_produces_no_relationships() {
        let client = Arc::new(MemoryGraphClient::new());
        let writer = writer(&client);
        writer
            .write_batch(
                Phase::Nodes,
                0,
                vec![Subgraph::from_node(merge_node("Person", "ID", "1", 0))],
            )
            .await
            .unwrap();

        let rel = Relationship {
            start: Endpoint::Node(merge_node("Person", "ID", "1", 0)),
            end: Endpoint::Match(NodeMatch {
                labels: vec!["Species".into()],
                conditions: vec![("Name".into(), Value::Str("virginica".into()))],
            }),
            rel_type: "likes".into(),
            properties: IndexMap::new(),
            primary_key_name: None,
            primary_key_value: None,
            merge: false,
        };
        let outcome = writer
            .write_batch(
                Phase::Relationships,
                0,
                vec![Subgraph::from_relationships(vec![rel])],
            )
            .await
            .unwrap();
        assert_eq!(outcome.relationships, 0);
        assert!(client.relationships_of_type("likes").await.is_empty());
    }

    #[tokio::test]
    async fn merge_relationships_deduplicate_in_batch() {
        let client = Arc::new(MemoryGraphClient::new());
        let writer = writer(&client);
        let a = merge_node("A", "id", "1", 0);
        let b = merge_node("B", "id", "2", 1);
        let rel = Relationship {
            start: Endpoint::Node(a.clone()),
            end: Endpoint::Node(b.clone()),
            rel_type: "links".into(),
            properties: {
                let mut m = IndexMap::new();
                m.insert("k".to_string(), Value::Int(9));
                m
            },
            primary_key_name: Some("k".into()),
            primary_key_value: Some(Value::Int(9)),
            merge: true,
        };
        let outcome = writer
            .write_batch(
                Phase::Relationships,
                0,
                vec![
                    Subgraph::from_relationships(vec![rel.clone()]),
                    Subgraph::from_relationships(vec![rel]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.relationships, 1);
        assert_eq!(client.relationships_of_type("links").await.len(), 1);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_retried() {
        let client = Arc::new(MemoryGraphClient::new());
        client.inject_commit_faults(0, 1);
        let writer = writer(&client);
        let outcome = writer
            .write_batch(
                Phase::Nodes,
                0,
                vec![Subgraph::from_node(merge_node("A", "id", "1", 0))],
            )
            .await
            .unwrap();
        assert_eq!(outcome.nodes, 1);
        assert_eq!(client.commit_attempts(), 2);
        assert_eq!(client.nodes_with_label("A").await.len(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_the_error() {
        let client = Arc::new(MemoryGraphClient::new());
        client.inject_commit_faults(0, 10);
        let writer = writer(&client);
        let err = writer
            .write_batch(
                Phase::Nodes,
                0,
                vec![Subgraph::from_node(merge_node("A", "id", "1", 0))],
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // retry_max = 2 means three attempts in total.
        assert_eq!(client.commit_attempts(), 3);
        assert!(client.nodes_with_label("A").await.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let client = Arc::new(MemoryGraphClient::new());
        let writer = writer(&client);
        let outcome = writer
            .write_batch(Phase::Nodes, 0, vec![Subgraph::default()])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(client.commit_attempts(), 0);
    }
}
