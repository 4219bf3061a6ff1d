use crate::prelude::*;

use crate::base::spec::{
    AttrLine, EndpointExpr, EntityBlock, LabelExpr, MatchExpr, NodeBlock, RelationshipBlock,
    SchemaAst, SubBlock, SubBlockKind, ValueExpr, WrapperUse,
};
use crate::base::value::Value;
use crate::ops::factory::{FactoryNode, InnerFactory};
use crate::ops::registry::{
    self, RegistrySnapshot, ResolvedSymbol, ResolvedWrapper, WrapperCategory,
};

use super::parser::parse_schema;

/// Executable form of a conversion schema, keyed by entity type. Compiled
/// once; applied to every resource of the run.
#[derive(Default, Debug)]
pub struct CompiledSchema {
    entities: HashMap<String, Arc<EntityPlan>>,
}

impl CompiledSchema {
    pub fn entity(&self, entity_type: &str) -> Option<&Arc<EntityPlan>> {
        self.entities.get(entity_type)
    }

    pub fn entity_types(&self) -> Vec<&str> {
        self.entities.keys().map(|s| s.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct EntityPlan {
    pub entity_type: String,
    /// Node sub-plans, in textual order.
    pub nodes: Vec<FactoryNode>,
    /// Relationship sub-plans, in textual order.
    pub relationships: Vec<FactoryNode>,
}

#[derive(Debug)]
pub struct NodePlanBody {
    pub labels: Vec<LabelPlan>,
    pub identifier: Option<String>,
    pub attrs: Vec<AttrPlan>,
}

#[derive(Debug)]
pub struct RelPlanBody {
    pub start: EndpointPlan,
    pub rel_type: String,
    pub end: EndpointPlan,
    pub attrs: Vec<AttrPlan>,
}

#[derive(Debug)]
pub struct AttrPlan {
    pub name: String,
    pub value: ValueTree,
    pub primary: bool,
}

pub enum ValueTree {
    Static(Value),
    EntityAttr { entity: String, attr: String },
    Wrapped {
        wrapper: ResolvedWrapper,
        inner: Box<ValueTree>,
    },
    Custom {
        name: String,
        wrapper: Arc<dyn crate::ops::factory::Wrapper>,
    },
}

impl std::fmt::Debug for ValueTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueTree::Static(v) => f.debug_tuple("Static").field(v).finish(),
            ValueTree::EntityAttr { entity, attr } => f
                .debug_struct("EntityAttr")
                .field("entity", entity)
                .field("attr", attr)
                .finish(),
            ValueTree::Wrapped { wrapper, inner } => f
                .debug_struct("Wrapped")
                .field("wrapper", wrapper)
                .field("inner", inner)
                .finish(),
            ValueTree::Custom { name, .. } => {
                f.debug_struct("Custom").field("name", name).finish()
            }
        }
    }
}

#[derive(Debug)]
pub enum LabelPlan {
    Literal(String),
    EntityAttr { entity: String, attr: String },
}

#[derive(Debug)]
pub enum EndpointPlan {
    Ident(String),
    Match(MatchPlan),
}

#[derive(Debug)]
pub struct MatchPlan {
    pub labels: Vec<LabelPlan>,
    pub conditions: Vec<(String, ValueTree)>,
}

/// Compile schema text against the process-wide registry.
pub fn compile(text: &str) -> Result<CompiledSchema> {
    compile_with_snapshot(text, &registry::global_snapshot())
}

/// Compile schema text against an explicit registry snapshot.
pub fn compile_with_snapshot(text: &str, snapshot: &RegistrySnapshot) -> Result<CompiledSchema> {
    let ast = parse_schema(text)?;
    analyze(ast, snapshot)
}

fn analyze(ast: SchemaAst, snapshot: &RegistrySnapshot) -> Result<CompiledSchema> {
    let mut plans: HashMap<String, EntityPlan> = HashMap::new();
    for block in ast.entities {
        let entity_type = block.entity_type.clone();
        let plan = analyze_entity(block, snapshot)?;
        match plans.get_mut(&entity_type) {
            // Repeated ENTITY blocks of the same type extend one plan.
            // Identifier scope stays per block.
            Some(existing) => {
                existing.nodes.extend(plan.nodes);
                existing.relationships.extend(plan.relationships);
            }
            None => {
                plans.insert(entity_type, plan);
            }
        }
    }
    Ok(CompiledSchema {
        entities: plans
            .into_iter()
            .map(|(name, plan)| (name, Arc::new(plan)))
            .collect(),
    })
}

fn analyze_entity(block: EntityBlock, snapshot: &RegistrySnapshot) -> Result<EntityPlan> {
    let entity_type = block.entity_type;
    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    let mut declared: HashSet<String> = HashSet::new();

    for sub_block in block.sub_blocks {
        let SubBlock { wrappers, kind } = sub_block;
        match kind {
            SubBlockKind::Node(node) => {
                if let Some(identifier) = &node.identifier {
                    declared.insert(identifier.clone());
                }
                let leaf = FactoryNode::Node(Arc::new(analyze_node(&entity_type, node, snapshot)?));
                nodes.push(apply_wrappers(leaf, wrappers, snapshot)?);
            }
            SubBlockKind::Relationship(rel) => {
                let leaf = FactoryNode::Relationship(Arc::new(analyze_relationship(
                    &entity_type,
                    rel,
                    &declared,
                    snapshot,
                )?));
                relationships.push(apply_wrappers(leaf, wrappers, snapshot)?);
            }
        }
    }

    Ok(EntityPlan {
        entity_type,
        nodes,
        relationships,
    })
}

fn analyze_node(
    entity_type: &str,
    block: NodeBlock,
    snapshot: &RegistrySnapshot,
) -> Result<NodePlanBody> {
    let labels = analyze_labels(block.labels)?;
    let attrs = analyze_attrs(entity_type, block.attributes, snapshot)?;

    let primary_count = attrs.iter().filter(|a| a.primary).count();
    if primary_count > 1 {
        return Err(Error::semantic(format!(
            "node in entity `{entity_type}` declares {primary_count} primary attributes, at most one is allowed"
        )));
    }
    if primary_count == 1 && !matches!(labels.first(), Some(LabelPlan::Literal(_))) {
        return Err(Error::semantic(format!(
            "node in entity `{entity_type}` has a primary attribute but its first label is not a literal"
        )));
    }

    Ok(NodePlanBody {
        labels,
        identifier: block.identifier,
        attrs,
    })
}

fn analyze_relationship(
    entity_type: &str,
    block: RelationshipBlock,
    declared: &HashSet<String>,
    snapshot: &RegistrySnapshot,
) -> Result<RelPlanBody> {
    let start = analyze_endpoint(entity_type, block.start, declared, snapshot)?;
    let end = analyze_endpoint(entity_type, block.end, declared, snapshot)?;
    let attrs = analyze_attrs(entity_type, block.attributes, snapshot)?;
    if attrs.iter().filter(|a| a.primary).count() > 1 {
        return Err(Error::semantic(format!(
            "relationship `{}` in entity `{entity_type}` declares more than one primary attribute",
            block.rel_type
        )));
    }
    Ok(RelPlanBody {
        start,
        rel_type: block.rel_type,
        end,
        attrs,
    })
}

fn analyze_endpoint(
    entity_type: &str,
    endpoint: EndpointExpr,
    declared: &HashSet<String>,
    snapshot: &RegistrySnapshot,
) -> Result<EndpointPlan> {
    match endpoint {
        EndpointExpr::Ident(name) => {
            if !declared.contains(&name) {
                return Err(Error::semantic(format!(
                    "relationship in entity `{entity_type}` references identifier `{name}` not declared above"
                )));
            }
            Ok(EndpointPlan::Ident(name))
        }
        EndpointExpr::Match(MatchExpr { labels, conditions }) => Ok(EndpointPlan::Match(MatchPlan {
            labels: analyze_labels(labels)?,
            conditions: conditions
                .into_iter()
                .map(|(name, value)| Ok((name, analyze_value(value, snapshot)?)))
                .collect::<Result<Vec<_>>>()?,
        })),
    }
}

fn analyze_labels(labels: Vec<LabelExpr>) -> Result<Vec<LabelPlan>> {
    Ok(labels
        .into_iter()
        .map(|label| match label {
            LabelExpr::Literal(s) => LabelPlan::Literal(s),
            LabelExpr::EntityAttr { entity, attr } => LabelPlan::EntityAttr { entity, attr },
        })
        .collect())
}

fn analyze_attrs(
    entity_type: &str,
    attributes: Vec<AttrLine>,
    snapshot: &RegistrySnapshot,
) -> Result<Vec<AttrPlan>> {
    let mut seen = HashSet::new();
    attributes
        .into_iter()
        .map(|line| {
            if !seen.insert(line.name.clone()) {
                return Err(Error::semantic(format!(
                    "attribute `{}` declared twice in entity `{entity_type}`",
                    line.name
                )));
            }
            Ok(AttrPlan {
                name: line.name,
                value: analyze_value(line.value, snapshot)?,
                primary: line.primary,
            })
        })
        .collect()
}

fn analyze_value(expr: ValueExpr, snapshot: &RegistrySnapshot) -> Result<ValueTree> {
    let tree = match expr {
        ValueExpr::Literal(value) => ValueTree::Static(value),
        ValueExpr::EntityAttr { entity, attr } => ValueTree::EntityAttr { entity, attr },
        ValueExpr::Call {
            name,
            inner,
            static_args,
        } => {
            let inner = Box::new(analyze_value(*inner, snapshot)?);
            match snapshot.resolve(&name, WrapperCategory::Attribute) {
                None => return Err(Error::SchemaUnknownSymbol(name)),
                Some(ResolvedSymbol::PrePost { pre, post }) => ValueTree::Wrapped {
                    wrapper: ResolvedWrapper {
                        name,
                        static_args,
                        pre,
                        post,
                    },
                    inner,
                },
                Some(ResolvedSymbol::Full(factory)) => {
                    let inner: Arc<ValueTree> = Arc::from(inner);
                    let handle = InnerFactory::new(move |resource, ctx| {
                        crate::ops::factory::construct_value_tree(&inner, resource, ctx)
                    });
                    ValueTree::Custom {
                        wrapper: factory.wrap(handle, static_args)?,
                        name,
                    }
                }
            }
        }
    };
    Ok(tree)
}

fn apply_wrappers(
    leaf: FactoryNode,
    wrappers: Vec<WrapperUse>,
    snapshot: &RegistrySnapshot,
) -> Result<FactoryNode> {
    let mut node = leaf;
    // Innermost wrapper applies first; the AST lists them outermost-first.
    for use_site in wrappers.into_iter().rev() {
        let WrapperUse { name, static_args } = use_site;
        node = match snapshot.resolve(&name, WrapperCategory::Subgraph) {
            None => return Err(Error::SchemaUnknownSymbol(name)),
            Some(ResolvedSymbol::PrePost { pre, post }) => FactoryNode::Wrapped {
                wrapper: ResolvedWrapper {
                    name,
                    static_args,
                    pre,
                    post,
                },
                child: Arc::new(node),
            },
            Some(ResolvedSymbol::Full(factory)) => {
                let child = Arc::new(node);
                let handle = InnerFactory::new(move |resource, ctx| child.construct(resource, ctx));
                FactoryNode::Custom {
                    wrapper: factory.wrap(handle, static_args)?,
                    name,
                }
            }
        };
    }
    Ok(node)
}
