use thiserror::Error;

/// All errors produced by the conversion engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed schema text: brackets, indentation, or literals.
    #[error("schema parse error at {line}:{column}: {message}")]
    SchemaParse {
        line: usize,
        column: usize,
        message: String,
    },

    /// Structurally valid schema with invalid meaning (undeclared identifier,
    /// duplicate primary attribute, non-literal entity type).
    #[error("schema semantic error: {0}")]
    SchemaSemantic(String),

    /// A wrapper name used in the schema is not in the registry snapshot.
    #[error("unknown wrapper `{0}`")]
    SchemaUnknownSymbol(String),

    /// A user wrapper or resource accessor failed on a specific resource.
    #[error("resource access failed ({context}): {source}")]
    ResourceAccess {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A graph-driver error worth retrying (connection loss, timeout,
    /// transient server state).
    #[error("transient graph error: {0}")]
    TransientGraph(#[source] anyhow::Error),

    /// A graph-driver error that retrying cannot fix.
    #[error("graph error: {0}")]
    Graph(#[source] anyhow::Error),

    /// A batch could not be committed after retry exhaustion. The engine
    /// halts; the checkpoint is preserved so a re-invocation resumes from the
    /// failed batch.
    #[error("conversion failed in {phase} at batch {batch_index}: {source}")]
    ConversionFailed {
        phase: &'static str,
        batch_index: usize,
        #[source]
        source: Box<Error>,
    },

    /// Invalid engine configuration, rejected before any work starts.
    #[error("config: {0}")]
    Config(String),

    /// User-provided wrapper code returned an error.
    #[error(transparent)]
    User(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn semantic(msg: impl Into<String>) -> Self {
        Error::SchemaSemantic(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn user(err: impl Into<anyhow::Error>) -> Self {
        Error::User(err.into())
    }

    pub fn resource_access(context: impl Into<String>, err: impl Into<anyhow::Error>) -> Self {
        Error::ResourceAccess {
            context: context.into(),
            source: err.into(),
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientGraph(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let err = Error::TransientGraph(anyhow::anyhow!("connection reset"));
        assert!(err.is_transient());
        assert!(!Error::Graph(anyhow::anyhow!("constraint violated")).is_transient());
    }

    #[test]
    fn conversion_failed_preserves_source() {
        let inner = Error::TransientGraph(anyhow::anyhow!("timeout"));
        let err = Error::ConversionFailed {
            phase: "nodes",
            batch_index: 3,
            source: Box::new(inner),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 3"));
        assert!(msg.contains("nodes"));
    }
}
