use crate::prelude::*;

use crate::base::value::Value;
use std::fmt;

/// Engine-internal identity of a constructed node instance.
///
/// Deterministic across phases: the same resource position and sub-plan index
/// always produce the same uid, which is how relationship endpoints find
/// nodes that carry no merge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeUid {
    pub resource_ordinal: u64,
    pub subplan_idx: u32,
}

/// Merge identity of a node: `(primary_label, key name, key value)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeIdentity {
    pub label: String,
    pub key_name: String,
    pub key_value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentity {
    Merge(MergeIdentity),
    Uid(NodeUid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Ordered, non-empty. The first label is the primary label of a merge
    /// target.
    pub labels: Vec<String>,
    pub properties: IndexMap<String, Value>,
    pub primary_label: Option<String>,
    pub primary_key_name: Option<String>,
    pub primary_key_value: Option<Value>,
    pub merge: bool,
    pub uid: NodeUid,
}

impl Node {
    pub fn merge_identity(&self) -> Option<MergeIdentity> {
        if !self.merge {
            return None;
        }
        Some(MergeIdentity {
            label: self.primary_label.clone()?,
            key_name: self.primary_key_name.clone()?,
            key_value: self.primary_key_value.clone()?,
        })
    }

    /// Identity used for deduplication: merge identity for merge targets,
    /// per-instance uid otherwise.
    pub fn identity(&self) -> NodeIdentity {
        match self.merge_identity() {
            Some(id) => NodeIdentity::Merge(id),
            None => NodeIdentity::Uid(self.uid),
        }
    }

    /// Labels other than the primary one, for merge targets.
    pub fn extra_labels(&self) -> Vec<String> {
        match &self.primary_label {
            Some(primary) => self
                .labels
                .iter()
                .filter(|l| *l != primary)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Fold `other`'s properties into this node, last writer wins.
    pub fn fold_properties(&mut self, other: &Node) {
        for (key, value) in &other.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        for label in &other.labels {
            if !self.labels.contains(label) {
                self.labels.push(label.clone());
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(:{}", self.labels.iter().join(":"))?;
        if let Some(id) = self.merge_identity() {
            write!(f, " {{{}: {}}}", id.key_name, id.key_value)?;
        }
        write!(f, ")")
    }
}

/// A pattern over existing graph nodes: every label and every
/// `property = value` condition must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeMatch {
    pub labels: Vec<String>,
    pub conditions: Vec<(String, Value)>,
}

impl fmt::Display for NodeMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MATCH(:{}", self.labels.iter().join(":"))?;
        for (name, value) in &self.conditions {
            write!(f, " {name}={value}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// A node constructed earlier for the same resource.
    Node(Node),
    /// A pattern resolved against the graph at write time.
    Match(NodeMatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub start: Endpoint,
    pub end: Endpoint,
    pub rel_type: String,
    pub properties: IndexMap<String, Value>,
    pub primary_key_name: Option<String>,
    pub primary_key_value: Option<Value>,
    pub merge: bool,
}

impl Relationship {
    /// Merge identity: endpoint identities, type, and primary key. `None`
    /// for non-merge relationships (each instance is a parallel edge) and
    /// for relationships with a matcher endpoint, whose identity is only
    /// known once the matcher resolves.
    pub fn merge_identity(&self) -> Option<RelMergeIdentity> {
        if !self.merge {
            return None;
        }
        let start = match &self.start {
            Endpoint::Node(n) => n.identity(),
            Endpoint::Match(_) => return None,
        };
        let end = match &self.end {
            Endpoint::Node(n) => n.identity(),
            Endpoint::Match(_) => return None,
        };
        Some(RelMergeIdentity {
            start,
            end,
            rel_type: self.rel_type.clone(),
            key_name: self.primary_key_name.clone()?,
            key_value: self.primary_key_value.clone()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelMergeIdentity {
    pub start: NodeIdentity,
    pub end: NodeIdentity,
    pub rel_type: String,
    pub key_name: String,
    pub key_value: Value,
}

/// The product of one resource under one entity plan: the unit the engine
/// accumulates into batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

impl Subgraph {
    pub fn from_node(node: Node) -> Self {
        Self {
            nodes: vec![node],
            relationships: Vec::new(),
        }
    }

    pub fn from_relationships(relationships: Vec<Relationship>) -> Self {
        Self {
            nodes: Vec::new(),
            relationships,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    /// Union by identity. Merge-identical nodes fold their property maps
    /// (last writer wins); merge-identical relationships likewise. Non-merge
    /// elements are kept as distinct instances.
    pub fn union(&mut self, other: Subgraph) {
        for node in other.nodes {
            self.add_node(node);
        }
        for rel in other.relationships {
            self.add_relationship(rel);
        }
    }

    pub fn add_node(&mut self, node: Node) {
        let identity = node.identity();
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.identity() == identity) {
            existing.fold_properties(&node);
        } else {
            self.nodes.push(node);
        }
    }

    pub fn add_relationship(&mut self, rel: Relationship) {
        if let Some(identity) = rel.merge_identity() {
            if let Some(existing) = self
                .relationships
                .iter_mut()
                .find(|r| r.merge_identity().as_ref() == Some(&identity))
            {
                for (key, value) in &rel.properties {
                    existing.properties.insert(key.clone(), value.clone());
                }
                return;
            }
        }
        self.relationships.push(rel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge_node(label: &str, key: &str, value: impl Into<Value>, uid_ord: u64) -> Node {
        let value = value.into();
        let mut properties = IndexMap::new();
        properties.insert(key.to_string(), value.clone());
        Node {
            labels: vec![label.to_string()],
            properties,
            primary_label: Some(label.to_string()),
            primary_key_name: Some(key.to_string()),
            primary_key_value: Some(value),
            merge: true,
            uid: NodeUid {
                resource_ordinal: uid_ord,
                subplan_idx: 0,
            },
        }
    }

    fn plain_node(label: &str, uid_ord: u64) -> Node {
        Node {
            labels: vec![label.to_string()],
            properties: IndexMap::new(),
            primary_label: None,
            primary_key_name: None,
            primary_key_value: None,
            merge: false,
            uid: NodeUid {
                resource_ordinal: uid_ord,
                subplan_idx: 0,
            },
        }
    }

    #[test]
    fn merge_nodes_unify_by_identity() {
        let mut subgraph = Subgraph::default();
        let mut a = merge_node("Species", "Name", "setosa", 0);
        a.properties.insert("genus".into(), Value::Str("Iris".into()));
        let mut b = merge_node("Species", "Name", "setosa", 1);
        b.properties
            .insert("genus".into(), Value::Str("Overwritten".into()));
        subgraph.add_node(a);
        subgraph.add_node(b);
        assert_eq!(subgraph.nodes.len(), 1);
        // Last writer wins within a single accumulation.
        assert_eq!(
            subgraph.nodes[0].properties.get("genus"),
            Some(&Value::Str("Overwritten".into()))
        );
    }

    #[test]
    fn distinct_merge_keys_stay_distinct() {
        let mut subgraph = Subgraph::default();
        subgraph.add_node(merge_node("Species", "Name", "setosa", 0));
        subgraph.add_node(merge_node("Species", "Name", "versicolor", 1));
        assert_eq!(subgraph.nodes.len(), 2);
    }

    #[test]
    fn non_merge_nodes_never_unify() {
        let mut subgraph = Subgraph::default();
        subgraph.add_node(plain_node("Flower", 0));
        subgraph.add_node(plain_node("Flower", 1));
        assert_eq!(subgraph.nodes.len(), 2);
    }

    #[test]
    fn merging_same_node_twice_equals_once() {
        let mut once = Subgraph::default();
        once.add_node(merge_node("Species", "Name", "setosa", 0));

        let mut twice = Subgraph::default();
        twice.add_node(merge_node("Species", "Name", "setosa", 0));
        twice.add_node(merge_node("Species", "Name", "setosa", 1));

        assert_eq!(once.nodes.len(), twice.nodes.len());
        assert_eq!(once.nodes[0].properties, twice.nodes[0].properties);
    }

    #[test]
    fn merge_relationships_dedupe_on_identity() {
        let start = merge_node("A", "id", 1i64, 0);
        let end = merge_node("B", "id", 2i64, 1);
        let rel = |key_value: i64| Relationship {
            start: Endpoint::Node(start.clone()),
            end: Endpoint::Node(end.clone()),
            rel_type: "links".into(),
            properties: IndexMap::new(),
            primary_key_name: Some("k".into()),
            primary_key_value: Some(Value::Int(key_value)),
            merge: true,
        };
        let mut subgraph = Subgraph::default();
        subgraph.add_relationship(rel(1));
        subgraph.add_relationship(rel(1));
        subgraph.add_relationship(rel(2));
        assert_eq!(subgraph.relationships.len(), 2);
    }

    #[test]
    fn non_merge_relationships_stay_parallel() {
        let start = merge_node("A", "id", 1i64, 0);
        let end = merge_node("B", "id", 2i64, 1);
        let rel = Relationship {
            start: Endpoint::Node(start),
            end: Endpoint::Node(end),
            rel_type: "links".into(),
            properties: IndexMap::new(),
            primary_key_name: None,
            primary_key_value: None,
            merge: false,
        };
        let mut subgraph = Subgraph::default();
        subgraph.add_relationship(rel.clone());
        subgraph.add_relationship(rel);
        assert_eq!(subgraph.relationships.len(), 2);
    }

    #[test]
    fn extra_labels_exclude_primary() {
        let mut node = merge_node("Species", "Name", "setosa", 0);
        node.labels.push("BioEntity".into());
        assert_eq!(node.extra_labels(), vec!["BioEntity".to_string()]);
    }
}
