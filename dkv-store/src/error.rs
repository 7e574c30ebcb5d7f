use thiserror::Error;

/// Store and cohort failures. All variants are fatal to the run except
/// where the caller explicitly states otherwise.
#[derive(Debug, Error)]
pub enum DkvError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("pi cache overflow: requested {requested} records, capacity {capacity}")]
    BufferOverflow { requested: usize, capacity: usize },

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DkvError>;
