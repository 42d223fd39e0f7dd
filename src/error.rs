#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("an active memory already exists for key '{0}'")]
    DuplicateKey(String),

    #[error("memory not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("context configuration error: {0}")]
    ContextConfig(String),

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("distiller produced unusable JSON: {0}")]
    DistillParse(String),

    #[error("turn cancelled by caller")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
