use crate::prelude::*;

use crate::base::value::{Attribute, Value};
use crate::compiler::plan::{
    AttrPlan, EndpointPlan, LabelPlan, MatchPlan, NodePlanBody, RelPlanBody, ValueTree,
};
use crate::execution::Phase;
use crate::graph::model::{Endpoint, Node, NodeMatch, NodeUid, Relationship, Subgraph};
use crate::ops::interface::Resource;
use crate::ops::registry::{PreFlow, ResolvedWrapper};
use crate::shared_state::SharedState;

/// What a factory produces for one resource.
#[derive(Debug, Clone)]
pub enum Product {
    Attribute(Attribute),
    Subgraph(Subgraph),
}

impl Product {
    pub fn kind(&self) -> &'static str {
        match self {
            Product::Attribute(_) => "attribute",
            Product::Subgraph(_) => "subgraph",
        }
    }
}

/// Context handed to wrapper bodies: the shared-state slots and the phase
/// being executed.
#[derive(Clone)]
pub struct WrapperContext {
    pub shared: Arc<SharedState>,
    pub phase: Phase,
}

/// Per-resource construction state.
pub struct ConstructContext {
    pub wrapper_ctx: WrapperContext,
    /// Local identifier map: nodes produced earlier in this resource's plan.
    pub idents: HashMap<String, Node>,
    pub resource_ordinal: u64,
    pub subplan_idx: u32,
}

impl ConstructContext {
    pub fn new(shared: Arc<SharedState>, phase: Phase, resource_ordinal: u64) -> Self {
        Self {
            wrapper_ctx: WrapperContext { shared, phase },
            idents: HashMap::new(),
            resource_ordinal,
            subplan_idx: 0,
        }
    }

    fn uid(&self) -> NodeUid {
        NodeUid {
            resource_ordinal: self.resource_ordinal,
            subplan_idx: self.subplan_idx,
        }
    }
}

/// A user-defined full wrapper: holds the wrapped factory and takes over its
/// construction entirely.
pub trait Wrapper: Send + Sync {
    fn construct(
        &self,
        resource: &mut dyn Resource,
        ctx: &mut ConstructContext,
    ) -> Result<Option<Product>>;
}

/// Handle to the wrapped factory, given to a full wrapper at plan time.
#[derive(Clone)]
pub struct InnerFactory(
    Arc<dyn Fn(&mut dyn Resource, &mut ConstructContext) -> Result<Option<Product>> + Send + Sync>,
);

impl InnerFactory {
    pub fn new(
        f: impl Fn(&mut dyn Resource, &mut ConstructContext) -> Result<Option<Product>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }

    pub fn construct(
        &self,
        resource: &mut dyn Resource,
        ctx: &mut ConstructContext,
    ) -> Result<Option<Product>> {
        (self.0)(resource, ctx)
    }
}

/// One node or relationship sub-plan: the factory tree the engine invokes
/// once per resource per phase.
pub enum FactoryNode {
    Node(Arc<NodePlanBody>),
    Relationship(Arc<RelPlanBody>),
    /// Pre/post-processing wrapper around a child factory.
    Wrapped {
        wrapper: ResolvedWrapper,
        child: Arc<FactoryNode>,
    },
    /// User full wrapper, constructed at plan time around the child.
    Custom {
        name: String,
        wrapper: Arc<dyn Wrapper>,
    },
}

impl std::fmt::Debug for FactoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactoryNode::Node(body) => f.debug_tuple("Node").field(body).finish(),
            FactoryNode::Relationship(body) => f.debug_tuple("Relationship").field(body).finish(),
            FactoryNode::Wrapped { wrapper, child } => f
                .debug_struct("Wrapped")
                .field("wrapper", wrapper)
                .field("child", child)
                .finish(),
            FactoryNode::Custom { name, .. } => {
                f.debug_struct("Custom").field("name", name).finish()
            }
        }
    }
}

impl FactoryNode {
    pub fn construct(
        &self,
        resource: &mut dyn Resource,
        ctx: &mut ConstructContext,
    ) -> Result<Option<Product>> {
        match self {
            FactoryNode::Node(body) => construct_node(body, resource, ctx),
            FactoryNode::Relationship(body) => construct_relationship(body, resource, ctx),
            FactoryNode::Wrapped { wrapper, child } => {
                if let Some(pre) = &wrapper.pre {
                    match pre(resource, &wrapper.static_args, &ctx.wrapper_ctx)
                        .map_err(|e| wrapper_error(&wrapper.name, e))?
                    {
                        PreFlow::Continue => {}
                        PreFlow::Skip => return Ok(None),
                    }
                }
                let product = child.construct(resource, ctx)?;
                match (product, &wrapper.post) {
                    (Some(product), Some(post)) => {
                        let product = post(product, &wrapper.static_args, &ctx.wrapper_ctx)
                            .map_err(|e| wrapper_error(&wrapper.name, e))?;
                        Ok(Some(product))
                    }
                    (product, _) => Ok(product),
                }
            }
            FactoryNode::Custom { name, wrapper } => wrapper
                .construct(resource, ctx)
                .map_err(|e| wrapper_error(name, e)),
        }
    }
}

fn wrapper_error(name: &str, err: Error) -> Error {
    match err {
        err @ Error::ResourceAccess { .. } => err,
        err => Error::resource_access(format!("wrapper `{name}`"), err),
    }
}

fn construct_node(
    body: &NodePlanBody,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Product>> {
    let labels = evaluate_labels(&body.labels, resource)?;
    let Some(labels) = labels else {
        // A dynamic label read null; nothing sensible to produce.
        warn!(entity = %resource.entity_type(), "node label evaluated to null, skipping node");
        return Ok(None);
    };

    let mut properties = IndexMap::with_capacity(body.attrs.len());
    let mut primary: Option<Attribute> = None;
    for attr in &body.attrs {
        let Some(attribute) = evaluate_attr(attr, resource, ctx)? else {
            // A skipping pre-processor suppresses the whole product.
            return Ok(None);
        };
        if attr.primary {
            primary = Some(attribute.clone());
        }
        if !attribute.value.is_null() {
            properties.insert(attribute.key, attribute.value);
        }
    }

    let mut node = Node {
        labels,
        properties,
        primary_label: None,
        primary_key_name: None,
        primary_key_value: None,
        merge: false,
        uid: ctx.uid(),
    };

    if let Some(primary) = primary {
        if primary.value.is_null() {
            warn!(
                label = %node.labels[0],
                key = %primary.key,
                "primary attribute is null; creating node instead of merging"
            );
        } else {
            node.primary_label = Some(node.labels[0].clone());
            node.primary_key_name = Some(primary.key.clone());
            node.primary_key_value = Some(primary.value.clone());
            node.merge = true;
            // The merge key is always present in the property map too.
            node.properties.insert(primary.key, primary.value);
        }
    }

    if let Some(identifier) = &body.identifier {
        ctx.idents.insert(identifier.clone(), node.clone());
    }
    Ok(Some(Product::Subgraph(Subgraph::from_node(node))))
}

fn construct_relationship(
    body: &RelPlanBody,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Product>> {
    let Some(start) = resolve_endpoint(&body.start, resource, ctx)? else {
        trace!(rel_type = %body.rel_type, "start endpoint unavailable, skipping relationship");
        return Ok(None);
    };
    let Some(end) = resolve_endpoint(&body.end, resource, ctx)? else {
        trace!(rel_type = %body.rel_type, "end endpoint unavailable, skipping relationship");
        return Ok(None);
    };

    let mut properties = IndexMap::with_capacity(body.attrs.len());
    let mut primary: Option<Attribute> = None;
    for attr in &body.attrs {
        let Some(attribute) = evaluate_attr(attr, resource, ctx)? else {
            return Ok(None);
        };
        if attr.primary {
            primary = Some(attribute.clone());
        }
        if !attribute.value.is_null() {
            properties.insert(attribute.key, attribute.value);
        }
    }

    let mut rel = Relationship {
        start,
        end,
        rel_type: body.rel_type.clone(),
        properties,
        primary_key_name: None,
        primary_key_value: None,
        merge: false,
    };
    if let Some(primary) = primary {
        if primary.value.is_null() {
            warn!(
                rel_type = %rel.rel_type,
                key = %primary.key,
                "primary attribute is null; creating relationship instead of merging"
            );
        } else {
            rel.primary_key_name = Some(primary.key.clone());
            rel.primary_key_value = Some(primary.value.clone());
            rel.merge = true;
            rel.properties.insert(primary.key, primary.value);
        }
    }
    Ok(Some(Product::Subgraph(Subgraph::from_relationships(vec![
        rel,
    ]))))
}

fn resolve_endpoint(
    endpoint: &EndpointPlan,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Endpoint>> {
    match endpoint {
        EndpointPlan::Ident(name) => Ok(ctx
            .idents
            .get(name)
            .cloned()
            .map(Endpoint::Node)),
        EndpointPlan::Match(plan) => {
            let Some(matcher) = evaluate_match(plan, resource, ctx)? else {
                return Ok(None);
            };
            Ok(Some(Endpoint::Match(matcher)))
        }
    }
}

fn evaluate_match(
    plan: &MatchPlan,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<NodeMatch>> {
    let Some(labels) = evaluate_labels(&plan.labels, resource)? else {
        return Ok(None);
    };
    let mut conditions = Vec::with_capacity(plan.conditions.len());
    for (name, tree) in &plan.conditions {
        let Some(attribute) = evaluate_tree(tree, name, resource, ctx)? else {
            return Ok(None);
        };
        conditions.push((name.clone(), attribute.value));
    }
    Ok(Some(NodeMatch { labels, conditions }))
}

fn evaluate_labels(
    labels: &[LabelPlan],
    resource: &mut dyn Resource,
) -> Result<Option<Vec<String>>> {
    let mut out = Vec::with_capacity(labels.len());
    for label in labels {
        match label {
            LabelPlan::Literal(s) => out.push(s.clone()),
            LabelPlan::EntityAttr { attr, .. } => {
                let value = resource
                    .get(attr)
                    .map_err(|e| Error::resource_access(format!("label attribute `{attr}`"), e))?;
                match value {
                    Some(v) if !v.is_null() => out.push(v.render_to_string()),
                    _ => return Ok(None),
                }
            }
        }
    }
    Ok(Some(out))
}

fn evaluate_attr(
    attr: &AttrPlan,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Attribute>> {
    evaluate_tree(&attr.value, &attr.name, resource, ctx)
}

/// Evaluate a value tree as a standalone attribute factory, for full
/// wrappers holding a value-position child. The enclosing attribute plan
/// re-binds the name afterwards.
pub fn construct_value_tree(
    tree: &ValueTree,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Product>> {
    Ok(evaluate_tree(tree, "value", resource, ctx)?.map(Product::Attribute))
}

/// Evaluate a value tree to an attribute named `name`. `None` means a
/// pre-processor chose to skip the enclosing product.
fn evaluate_tree(
    tree: &ValueTree,
    name: &str,
    resource: &mut dyn Resource,
    ctx: &mut ConstructContext,
) -> Result<Option<Attribute>> {
    let attribute = match tree {
        ValueTree::Static(value) => Attribute::new(name, value.clone()),
        ValueTree::EntityAttr { attr, .. } => {
            let value = resource
                .get(attr)
                .map_err(|e| Error::resource_access(format!("attribute `{attr}`"), e))?;
            Attribute::new(name, value.unwrap_or(Value::Null))
        }
        ValueTree::Wrapped { wrapper, inner } => {
            if let Some(pre) = &wrapper.pre {
                match pre(resource, &wrapper.static_args, &ctx.wrapper_ctx)
                    .map_err(|e| wrapper_error(&wrapper.name, e))?
                {
                    PreFlow::Continue => {}
                    PreFlow::Skip => return Ok(None),
                }
            }
            let Some(attribute) = evaluate_tree(inner, name, resource, ctx)? else {
                return Ok(None);
            };
            match &wrapper.post {
                Some(post) => {
                    let product = post(
                        Product::Attribute(attribute),
                        &wrapper.static_args,
                        &ctx.wrapper_ctx,
                    )
                    .map_err(|e| wrapper_error(&wrapper.name, e))?;
                    match product {
                        Product::Attribute(a) => a,
                        Product::Subgraph(_) => {
                            warn!(
                                wrapper = %wrapper.name,
                                attribute = %name,
                                "wrapper returned a subgraph in attribute position, skipping"
                            );
                            return Ok(None);
                        }
                    }
                }
                None => attribute,
            }
        }
        ValueTree::Custom { name: wrapper_name, wrapper } => {
            let product = wrapper
                .construct(resource, ctx)
                .map_err(|e| wrapper_error(wrapper_name, e))?;
            match product {
                None => return Ok(None),
                Some(Product::Attribute(a)) => Attribute::new(name, a.value),
                Some(Product::Subgraph(_)) => {
                    warn!(
                        wrapper = %wrapper_name,
                        attribute = %name,
                        "wrapper returned a subgraph in attribute position, skipping"
                    );
                    return Ok(None);
                }
            }
        }
    };
    Ok(Some(attribute))
}
