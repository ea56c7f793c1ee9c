use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Determinism violation: {0}")]
    Determinism(String),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Host path not mappable: {0}")]
    HostPath(String),

    #[error("Container path not mappable: {0}")]
    ContainerPath(String),
}

pub type Result<T> = std::result::Result<T, BuildGraphError>;
