use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corpus is empty: {0}")]
    EmptyCorpus(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding backend returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index dimension {expected} does not match embedder dimension {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index at {0} is missing")]
    Missing(String),

    #[error("index is corrupt: {0}")]
    Corrupt(String),

    #[error("index build failed: {0}")]
    Build(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("background index task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("index not loaded; build or load an index before querying")]
    NotLoaded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("unparseable model response: {0}")]
    Unparseable(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("retrieval failed: {0}")]
    Search(#[from] SearchError),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("session {0} has been terminated")]
    SessionTerminated(uuid::Uuid),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),

    #[error("model mismatch: index was built with {expected}, embedder is {actual}")]
    ModelMismatch { expected: String, actual: String },

    #[error("invalid config value for {field}: {details}")]
    InvalidValue { field: &'static str, details: String },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("unable to read config file {path}: {details}")]
    File { path: String, details: String },
}
