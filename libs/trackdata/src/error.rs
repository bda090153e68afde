use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("query error \"{query}\": {message}")]
    Query { query: String, message: String },
    #[error("datafusion {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),
    #[error("arrow {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("column {0} missing from query result")]
    MissingColumn(usize),
    #[error("unsupported statement: {0}")]
    UnsupportedStatement(&'static str),
    #[error("invalid table function arguments: {0}")]
    InvalidTableFunctionArgs(String),
    #[error("unknown track kind {0}")]
    UnknownTrackKind(String),
    #[error("invalid config for track {track}: {source}")]
    InvalidTrackConfig {
        track: String,
        source: toml::de::Error,
    },
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parsing failed {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config not found {0}")]
    ConfigNotFound(String),
}

impl Error {
    /// Returns true for failures reported by the engine itself, as opposed to
    /// failures decoding or routing its results.
    pub fn is_query_error(&self) -> bool {
        matches!(self, Error::Query { .. })
    }
}
