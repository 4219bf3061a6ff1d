use crate::prelude::*;

use crate::base::value::Value;
use std::fmt;

/// Parsed form of a conversion schema: one block per entity type, in source
/// order. Produced by the parser, consumed by the plan analyzer.
#[derive(Debug, Clone, Default)]
pub struct SchemaAst {
    pub entities: Vec<EntityBlock>,
}

#[derive(Debug, Clone)]
pub struct EntityBlock {
    pub entity_type: String,
    pub sub_blocks: Vec<SubBlock>,
}

/// A node or relationship declaration, possibly inside a chain of wrapper
/// calls (outermost first).
#[derive(Debug, Clone)]
pub struct SubBlock {
    pub wrappers: Vec<WrapperUse>,
    pub kind: SubBlockKind,
}

#[derive(Debug, Clone)]
pub enum SubBlockKind {
    Node(NodeBlock),
    Relationship(RelationshipBlock),
}

/// A wrapper call site: the name resolved against the registry at plan time,
/// plus the literal static arguments following the wrapped block.
#[derive(Debug, Clone)]
pub struct WrapperUse {
    pub name: String,
    pub static_args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct NodeBlock {
    pub labels: Vec<LabelExpr>,
    pub identifier: Option<String>,
    pub attributes: Vec<AttrLine>,
}

#[derive(Debug, Clone)]
pub struct RelationshipBlock {
    pub start: EndpointExpr,
    pub rel_type: String,
    pub end: EndpointExpr,
    pub attributes: Vec<AttrLine>,
}

#[derive(Debug, Clone)]
pub enum EndpointExpr {
    /// Local identifier of a node declared above in the same entity block.
    Ident(String),
    Match(MatchExpr),
}

#[derive(Debug, Clone)]
pub struct MatchExpr {
    pub labels: Vec<LabelExpr>,
    pub conditions: Vec<(String, ValueExpr)>,
}

/// `-` marks a normal attribute, `+` the primary (merge key) attribute.
#[derive(Debug, Clone)]
pub struct AttrLine {
    pub name: String,
    pub value: ValueExpr,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub enum LabelExpr {
    Literal(String),
    EntityAttr { entity: String, attr: String },
}

#[derive(Debug, Clone)]
pub enum ValueExpr {
    Literal(Value),
    EntityAttr { entity: String, attr: String },
    /// Wrapper application around an inner value expression, e.g.
    /// `UPPER(Flower.species)`. Arguments after the first must be literals
    /// and become the wrapper's static arguments.
    Call {
        name: String,
        inner: Box<ValueExpr>,
        static_args: Vec<Value>,
    },
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpr::Literal(s) => write!(f, "{s:?}"),
            LabelExpr::EntityAttr { entity, attr } => write!(f, "{entity}.{attr}"),
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Literal(v) => write!(f, "{v}"),
            ValueExpr::EntityAttr { entity, attr } => write!(f, "{entity}.{attr}"),
            ValueExpr::Call {
                name,
                inner,
                static_args,
            } => {
                write!(f, "{name}({inner}")?;
                for arg in static_args {
                    write!(f, ", {arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for EndpointExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointExpr::Ident(name) => write!(f, "{name}"),
            EndpointExpr::Match(m) => {
                write!(f, "MATCH({}", m.labels.iter().join(", "))?;
                for (name, value) in &m.conditions {
                    write!(f, ", {name}={value}")?;
                }
                write!(f, ")")
            }
        }
    }
}
