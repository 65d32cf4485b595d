// Error types for hierarchy shaping and extraction

use crate::source::SourceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Data source error ({context}): {source}")]
    DataSource {
        context: String,
        #[source]
        source: SourceError,
    },

    #[error("Empty result: {0}")]
    Empty(String),

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn tag_not_found<S: Into<String>>(name: S) -> Self {
        Error::not_found("tag", name)
    }

    pub fn column_not_found<S: Into<String>>(name: S) -> Self {
        Error::not_found("column", name)
    }

    pub fn template_not_found<S: Into<String>>(name: S) -> Self {
        Error::not_found("template", name)
    }

    pub fn invalid_shape<S: Into<String>>(msg: S) -> Self {
        Error::InvalidShape(msg.into())
    }

    pub fn data_source<S: Into<String>>(context: S, source: SourceError) -> Self {
        Error::DataSource {
            context: context.into(),
            source,
        }
    }

    /// True for failures that name something missing rather than malformed.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Chunk { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
