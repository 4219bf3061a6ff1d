use crate::prelude::*;

use crate::base::value::Value;
use crate::graph::model::NodeMatch;
use neo4rs::{BoltType, Graph, Txn, query};

use super::{GraphClient, GraphTransaction, MergeNodeRow, NodeHandle, RelRow};

fn classify(err: neo4rs::Error) -> Error {
    let transient = match &err {
        neo4rs::Error::ConnectionError => true,
        neo4rs::Error::Neo4j(e) => e.kind() == neo4rs::Neo4jErrorKind::Transient,
        _ => false,
    };
    if transient {
        Error::TransientGraph(err.into())
    } else {
        Error::Graph(err.into())
    }
}

fn value_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(neo4rs::BoltNull::default()),
        Value::Bool(v) => BoltType::Boolean(neo4rs::BoltBoolean::new(*v)),
        Value::Int(v) => BoltType::Integer(neo4rs::BoltInteger::new(*v)),
        Value::Float(v) => BoltType::Float(neo4rs::BoltFloat::new(*v)),
        Value::Str(v) => BoltType::String(neo4rs::BoltString::new(v)),
        Value::Date(v) => BoltType::Date(neo4rs::BoltDate::from(*v)),
        Value::DateTime(v) => BoltType::DateTime(neo4rs::BoltDateTime::from(v.fixed_offset())),
    }
}

fn props_to_bolt(props: &IndexMap<String, Value>) -> BoltType {
    BoltType::Map(neo4rs::BoltMap {
        value: props
            .iter()
            .map(|(k, v)| (neo4rs::BoltString::new(k), value_to_bolt(v)))
            .collect(),
    })
}

fn bolt_list(items: Vec<BoltType>) -> BoltType {
    BoltType::List(neo4rs::BoltList { value: items })
}

/// Quote an identifier for interpolation into cypher.
fn ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn label_fragment(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{}", ident(l))).join("")
}

fn merge_nodes_cypher(primary_label: &str, key_name: &str, extra_labels: &[String]) -> String {
    let set_extra = if extra_labels.is_empty() {
        String::new()
    } else {
        format!("SET n{}\n", label_fragment(extra_labels))
    };
    format!(
        "UNWIND $rows AS row\n\
         MERGE (n:{label} {{{key}: row.key}})\n\
         SET n += row.props\n\
         {set_extra}\
         RETURN elementId(n) AS eid",
        label = ident(primary_label),
        key = ident(key_name),
    )
}

fn create_nodes_cypher(labels: &[String]) -> String {
    format!(
        "UNWIND $rows AS row\n\
         CREATE (n{labels})\n\
         SET n = row\n\
         RETURN elementId(n) AS eid",
        labels = label_fragment(labels),
    )
}

fn match_nodes_cypher(pattern: &NodeMatch) -> String {
    let conditions = if pattern.conditions.is_empty() {
        String::new()
    } else {
        let clauses = pattern
            .conditions
            .iter()
            .enumerate()
            .map(|(idx, (name, _))| format!("n.{} = $c{idx}", ident(name)))
            .join(" AND ");
        format!("WHERE {clauses}\n")
    };
    format!(
        "MATCH (n{labels})\n\
         {conditions}\
         RETURN elementId(n) AS eid",
        labels = label_fragment(&pattern.labels),
    )
}

fn merge_relationships_cypher(rel_type: &str, key_name: &str) -> String {
    format!(
        "UNWIND $rows AS row\n\
         MATCH (s) WHERE elementId(s) = row.start\n\
         MATCH (e) WHERE elementId(e) = row.end\n\
         MERGE (s)-[r:{rel_type} {{{key}: row.key}}]->(e)\n\
         SET r += row.props",
        rel_type = ident(rel_type),
        key = ident(key_name),
    )
}

fn create_relationships_cypher(rel_type: &str) -> String {
    format!(
        "UNWIND $rows AS row\n\
         MATCH (s) WHERE elementId(s) = row.start\n\
         MATCH (e) WHERE elementId(e) = row.end\n\
         CREATE (s)-[r:{rel_type}]->(e)\n\
         SET r = row.props",
        rel_type = ident(rel_type),
    )
}

/// `GraphClient` over a caller-supplied Bolt connection. Connecting and
/// configuring the driver stays with the embedding application; this type
/// only speaks the write protocol.
pub struct Neo4jClient {
    graph: Arc<Graph>,
}

impl Neo4jClient {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl GraphClient for Neo4jClient {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>> {
        let txn = self.graph.start_txn().await.map_err(classify)?;
        Ok(Box::new(Neo4jTransaction { txn }))
    }
}

struct Neo4jTransaction {
    txn: Txn,
}

impl Neo4jTransaction {
    async fn collect_handles(&mut self, q: neo4rs::Query) -> Result<Vec<NodeHandle>> {
        let mut stream = self.txn.execute(q).await.map_err(classify)?;
        let mut handles = Vec::new();
        while let Some(row) = stream.next(self.txn.handle()).await.map_err(classify)? {
            let eid: String = row
                .get("eid")
                .map_err(|e| Error::Graph(anyhow::anyhow!("missing eid column: {e}")))?;
            handles.push(NodeHandle(eid));
        }
        Ok(handles)
    }
}

#[async_trait]
impl GraphTransaction for Neo4jTransaction {
    async fn merge_nodes(
        &mut self,
        primary_label: &str,
        key_name: &str,
        rows: Vec<MergeNodeRow>,
    ) -> Result<Vec<NodeHandle>> {
        // One bulk statement per distinct extra-label set; labels cannot be
        // parameterized in cypher.
        let mut by_extra: IndexMap<Vec<String>, Vec<(usize, MergeNodeRow)>> = IndexMap::new();
        for (idx, row) in rows.into_iter().enumerate() {
            by_extra
                .entry(row.extra_labels.clone())
                .or_default()
                .push((idx, row));
        }
        let mut handles: Vec<Option<NodeHandle>> =
            vec![None; by_extra.values().map(Vec::len).sum()];
        for (extra_labels, group) in by_extra {
            let cypher = merge_nodes_cypher(primary_label, key_name, &extra_labels);
            let indices: Vec<usize> = group.iter().map(|(idx, _)| *idx).collect();
            let bolt_rows = bolt_list(
                group
                    .iter()
                    .map(|(_, row)| {
                        BoltType::Map(neo4rs::BoltMap {
                            value: [
                                (neo4rs::BoltString::new("key"), value_to_bolt(&row.key)),
                                (neo4rs::BoltString::new("props"), props_to_bolt(&row.properties)),
                            ]
                            .into_iter()
                            .collect(),
                        })
                    })
                    .collect(),
            );
            let group_handles = self
                .collect_handles(query(&cypher).param("rows", bolt_rows))
                .await?;
            if group_handles.len() != indices.len() {
                return Err(Error::Graph(anyhow::anyhow!(
                    "merge returned {} handles for {} rows",
                    group_handles.len(),
                    indices.len()
                )));
            }
            for (idx, handle) in indices.into_iter().zip(group_handles) {
                handles[idx] = Some(handle);
            }
        }
        Ok(handles.into_iter().map(|h| h.unwrap()).collect())
    }

    async fn create_nodes(
        &mut self,
        labels: &[String],
        rows: Vec<IndexMap<String, Value>>,
    ) -> Result<Vec<NodeHandle>> {
        let expected = rows.len();
        let bolt_rows = bolt_list(rows.iter().map(props_to_bolt).collect());
        let handles = self
            .collect_handles(query(&create_nodes_cypher(labels)).param("rows", bolt_rows))
            .await?;
        if handles.len() != expected {
            return Err(Error::Graph(anyhow::anyhow!(
                "create returned {} handles for {expected} rows",
                handles.len()
            )));
        }
        Ok(handles)
    }

    async fn match_nodes(&mut self, pattern: &NodeMatch) -> Result<Vec<NodeHandle>> {
        let mut q = query(&match_nodes_cypher(pattern));
        for (idx, (_, value)) in pattern.conditions.iter().enumerate() {
            q = q.param(&format!("c{idx}"), value_to_bolt(value));
        }
        self.collect_handles(q).await
    }

    async fn merge_relationships(
        &mut self,
        rel_type: &str,
        key_name: &str,
        rows: Vec<RelRow>,
    ) -> Result<()> {
        let bolt_rows = bolt_list(rows.iter().map(rel_row_to_bolt).collect());
        self.txn
            .run(query(&merge_relationships_cypher(rel_type, key_name)).param("rows", bolt_rows))
            .await
            .map_err(classify)
    }

    async fn create_relationships(&mut self, rel_type: &str, rows: Vec<RelRow>) -> Result<()> {
        let bolt_rows = bolt_list(rows.iter().map(rel_row_to_bolt).collect());
        self.txn
            .run(query(&create_relationships_cypher(rel_type)).param("rows", bolt_rows))
            .await
            .map_err(classify)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.txn.rollback().await.map_err(classify)
    }
}

fn rel_row_to_bolt(row: &RelRow) -> BoltType {
    let mut entries = vec![
        (
            neo4rs::BoltString::new("start"),
            BoltType::String(neo4rs::BoltString::new(&row.start.0)),
        ),
        (
            neo4rs::BoltString::new("end"),
            BoltType::String(neo4rs::BoltString::new(&row.end.0)),
        ),
        (neo4rs::BoltString::new("props"), props_to_bolt(&row.properties)),
    ];
    if let Some(key) = &row.key {
        entries.push((neo4rs::BoltString::new("key"), value_to_bolt(key)));
    }
    BoltType::Map(neo4rs::BoltMap {
        value: entries.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_cypher_shapes() {
        let cypher = merge_nodes_cypher("Species", "Name", &["BioEntity".to_string()]);
        assert!(cypher.contains("MERGE (n:`Species` {`Name`: row.key})"));
        assert!(cypher.contains("SET n += row.props"));
        assert!(cypher.contains("SET n:`BioEntity`"));
        assert!(cypher.contains("RETURN elementId(n) AS eid"));

        let bare = merge_nodes_cypher("Species", "Name", &[]);
        assert!(!bare.contains("SET n:`"));
    }

    #[test]
    fn match_cypher_includes_conditions() {
        let cypher = match_nodes_cypher(&NodeMatch {
            labels: vec!["Species".into(), "BioEntity".into()],
            conditions: vec![("Name".into(), Value::Str("setosa".into()))],
        });
        assert!(cypher.contains("MATCH (n:`Species`:`BioEntity`)"));
        assert!(cypher.contains("WHERE n.`Name` = $c0"));
    }

    #[test]
    fn relationship_cyphers_bind_endpoints_by_element_id() {
        let merged = merge_relationships_cypher("likes", "since");
        assert!(merged.contains("MERGE (s)-[r:`likes` {`since`: row.key}]->(e)"));
        assert!(merged.contains("elementId(s) = row.start"));

        let created = create_relationships_cypher("likes");
        assert!(created.contains("CREATE (s)-[r:`likes`]->(e)"));
        assert!(created.contains("SET r = row.props"));
    }

    #[test]
    fn identifiers_are_backquoted() {
        assert_eq!(ident("plain"), "`plain`");
        assert_eq!(ident("with`tick"), "`with``tick`");
    }

    #[test]
    fn bolt_conversion_covers_scalars() {
        assert!(matches!(value_to_bolt(&Value::Null), BoltType::Null(_)));
        assert!(matches!(value_to_bolt(&Value::Int(3)), BoltType::Integer(_)));
        assert!(matches!(
            value_to_bolt(&Value::Float(1.5)),
            BoltType::Float(_)
        ));
        assert!(matches!(
            value_to_bolt(&Value::Str("x".into())),
            BoltType::String(_)
        ));
        assert!(matches!(
            value_to_bolt(&Value::Bool(true)),
            BoltType::Boolean(_)
        ));
    }
}
