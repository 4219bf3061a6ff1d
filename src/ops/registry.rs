use crate::prelude::*;

use crate::base::value::{Attribute, Value};
use crate::graph::model::Subgraph;
use crate::ops::factory::{InnerFactory, Product, Wrapper, WrapperContext};
use crate::ops::interface::Resource;

/// Outcome of a pre-processor: go on with the (possibly modified) resource,
/// or skip the wrapped factory's product entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFlow {
    Continue,
    Skip,
}

pub type PreProcessorFn =
    Arc<dyn Fn(&mut dyn Resource, &[Value], &WrapperContext) -> Result<PreFlow> + Send + Sync>;

/// Post-processors operate on the produced value. They are stored behind a
/// product adapter so a category-mismatched application degrades to a warning
/// instead of a type error.
pub type ProductPostFn =
    Arc<dyn Fn(Product, &[Value], &WrapperContext) -> Result<Product> + Send + Sync>;

/// Builds a full wrapper instance around the wrapped factory at plan time.
pub trait WrapperFactory: Send + Sync {
    fn wrap(&self, inner: InnerFactory, static_args: Vec<Value>) -> Result<Arc<dyn Wrapper>>;
}

impl<F> WrapperFactory for F
where
    F: Fn(InnerFactory, Vec<Value>) -> Result<Arc<dyn Wrapper>> + Send + Sync,
{
    fn wrap(&self, inner: InnerFactory, static_args: Vec<Value>) -> Result<Arc<dyn Wrapper>> {
        self(inner, static_args)
    }
}

/// Which position a wrapper name is being resolved for. Determines lookup
/// priority only; category mismatches are not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperCategory {
    Attribute,
    Subgraph,
}

/// A wrapper call site after resolution against a registry snapshot.
#[derive(Clone)]
pub struct ResolvedWrapper {
    pub name: String,
    pub static_args: Vec<Value>,
    pub pre: Option<PreProcessorFn>,
    pub post: Option<ProductPostFn>,
}

impl std::fmt::Debug for ResolvedWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedWrapper")
            .field("name", &self.name)
            .field("static_args", &self.static_args)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

/// Resolution result: either a pre/post pair or a full wrapper factory.
#[derive(Clone)]
pub enum ResolvedSymbol {
    PrePost {
        pre: Option<PreProcessorFn>,
        post: Option<ProductPostFn>,
    },
    Full(Arc<dyn WrapperFactory>),
}

/// Process-wide catalog of named wrapper code, in five families. Mutable
/// during the registration phase, then read through immutable snapshots
/// frozen into compiled plans.
#[derive(Default, Clone)]
pub struct WrapperRegistry {
    attr_pre: HashMap<String, PreProcessorFn>,
    attr_post: HashMap<String, ProductPostFn>,
    subgraph_pre: HashMap<String, PreProcessorFn>,
    subgraph_post: HashMap<String, ProductPostFn>,
    full: HashMap<String, Arc<dyn WrapperFactory>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_attribute_preprocessor(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut dyn Resource, &[Value], &WrapperContext) -> Result<PreFlow>
            + Send
            + Sync
            + 'static,
    ) {
        let name = name.into();
        if self.attr_pre.insert(name.clone(), Arc::new(f)).is_some() {
            warn!(wrapper = %name, "attribute pre-processor re-registered, replacing previous binding");
        }
    }

    pub fn register_attribute_postprocessor(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(Attribute, &[Value], &WrapperContext) -> Result<Attribute> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let adapter = adapt_attribute_post(name.clone(), f);
        if self.attr_post.insert(name.clone(), adapter).is_some() {
            warn!(wrapper = %name, "attribute post-processor re-registered, replacing previous binding");
        }
    }

    pub fn register_subgraph_preprocessor(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut dyn Resource, &[Value], &WrapperContext) -> Result<PreFlow>
            + Send
            + Sync
            + 'static,
    ) {
        let name = name.into();
        if self.subgraph_pre.insert(name.clone(), Arc::new(f)).is_some() {
            warn!(wrapper = %name, "subgraph pre-processor re-registered, replacing previous binding");
        }
    }

    pub fn register_subgraph_postprocessor(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(Subgraph, &[Value], &WrapperContext) -> Result<Subgraph> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let adapter = adapt_subgraph_post(name.clone(), f);
        if self.subgraph_post.insert(name.clone(), adapter).is_some() {
            warn!(wrapper = %name, "subgraph post-processor re-registered, replacing previous binding");
        }
    }

    pub fn register_wrapper(
        &mut self,
        name: impl Into<String>,
        factory: impl WrapperFactory + 'static,
    ) {
        let name = name.into();
        if self.full.insert(name.clone(), Arc::new(factory)).is_some() {
            warn!(wrapper = %name, "full wrapper re-registered, replacing previous binding");
        }
    }

    /// Freeze the current bindings. Later registrations do not affect plans
    /// compiled against this snapshot.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            inner: Arc::new(self.clone()),
        }
    }
}

/// Immutable view of the registry observed at compile time.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    inner: Arc<WrapperRegistry>,
}

impl RegistrySnapshot {
    /// Look a name up across all families. The category sets priority when
    /// the same name is bound in more than one family; a name bound only in
    /// the "wrong" family still resolves (undefined-behaviour territory,
    /// handled with warnings at construct time).
    pub fn resolve(&self, name: &str, category: WrapperCategory) -> Option<ResolvedSymbol> {
        if let Some(factory) = self.inner.full.get(name) {
            return Some(ResolvedSymbol::Full(factory.clone()));
        }
        let (pre, post) = match category {
            WrapperCategory::Attribute => (
                self.inner
                    .attr_pre
                    .get(name)
                    .or_else(|| self.inner.subgraph_pre.get(name)),
                self.inner
                    .attr_post
                    .get(name)
                    .or_else(|| self.inner.subgraph_post.get(name)),
            ),
            WrapperCategory::Subgraph => (
                self.inner
                    .subgraph_pre
                    .get(name)
                    .or_else(|| self.inner.attr_pre.get(name)),
                self.inner
                    .subgraph_post
                    .get(name)
                    .or_else(|| self.inner.attr_post.get(name)),
            ),
        };
        if pre.is_none() && post.is_none() {
            return None;
        }
        Some(ResolvedSymbol::PrePost {
            pre: pre.cloned(),
            post: post.cloned(),
        })
    }
}

fn adapt_attribute_post(
    name: String,
    f: impl Fn(Attribute, &[Value], &WrapperContext) -> Result<Attribute> + Send + Sync + 'static,
) -> ProductPostFn {
    Arc::new(move |product, args, ctx| match product {
        Product::Attribute(attribute) => Ok(Product::Attribute(f(attribute, args, ctx)?)),
        other => {
            warn!(
                wrapper = %name,
                product = other.kind(),
                "attribute post-processor applied to a non-attribute product, passing through"
            );
            Ok(other)
        }
    })
}

fn adapt_subgraph_post(
    name: String,
    f: impl Fn(Subgraph, &[Value], &WrapperContext) -> Result<Subgraph> + Send + Sync + 'static,
) -> ProductPostFn {
    Arc::new(move |product, args, ctx| match product {
        Product::Subgraph(subgraph) => Ok(Product::Subgraph(f(subgraph, args, ctx)?)),
        other => {
            warn!(
                wrapper = %name,
                product = other.kind(),
                "subgraph post-processor applied to a non-subgraph product, passing through"
            );
            Ok(other)
        }
    })
}

// Process-wide registry: register before constructing a converter; the
// snapshot taken at compile time is what a running conversion sees.

static GLOBAL_REGISTRY: LazyLock<RwLock<WrapperRegistry>> =
    LazyLock::new(|| RwLock::new(WrapperRegistry::new()));

pub fn with_global<R>(f: impl FnOnce(&mut WrapperRegistry) -> R) -> R {
    let mut registry = GLOBAL_REGISTRY.write().unwrap();
    f(&mut registry)
}

pub fn global_snapshot() -> RegistrySnapshot {
    GLOBAL_REGISTRY.read().unwrap().snapshot()
}
