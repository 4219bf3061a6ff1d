//! Convert rows of relational data into a property graph, driven by a
//! declarative conversion schema.
//!
//! The schema names which entity types become which nodes and
//! relationships, how attributes are projected, which attribute is the merge
//! key, and how to match pre-existing graph elements by pattern. The engine
//! compiles the schema once, then applies the compiled plan to every
//! incoming resource in two ordered phases (nodes, then relationships),
//! batching transactions to the graph database.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rel2graph::client::memory::MemoryGraphClient;
//! use rel2graph::{Converter, EngineOptions, SimpleResource, VecResourceIterator};
//!
//! # async fn example() -> rel2graph::Result<()> {
//! let schema = r#"
//! ENTITY("Flower"):
//!     NODE("Flower") flower:
//!         - sepal_length = Flower.sepal_length
//!     NODE("Species") species:
//!         + Name = Flower.species
//!     RELATIONSHIP(flower, "is", species):
//! "#;
//!
//! let iterator = VecResourceIterator::new()
//!     .with(SimpleResource::new("Flower").with("sepal_length", 5.1).with("species", "setosa"));
//! let client = Arc::new(MemoryGraphClient::new());
//! let mut converter =
//!     Converter::new(schema, Box::new(iterator), client, EngineOptions::default())?;
//! let report = converter.run().await?;
//! println!("{}", report.stats);
//! # Ok(())
//! # }
//! ```

mod prelude;

pub mod base;
pub mod client;
pub mod compiler;
pub mod error;
pub mod execution;
pub mod graph;
pub mod ops;
pub mod settings;
pub mod shared_state;
pub mod utils;

pub use base::value::{Attribute, Value};
pub use client::{GraphClient, GraphTransaction};
pub use compiler::compile;
pub use error::{Error, Result};
pub use execution::engine::{ConversionReport, Converter};
pub use graph::model::{Node, NodeMatch, Relationship, Subgraph};
pub use ops::interface::{Resource, ResourceIterator, SimpleResource, VecResourceIterator};
pub use ops::registry::WrapperRegistry;
pub use settings::EngineOptions;
pub use shared_state::SharedState;
