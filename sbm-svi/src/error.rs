use thiserror::Error;

/// Learner-level failures. `Config` and `Numeric` abort the run; numeric
/// trouble inside the perplexity evaluator is logged per edge instead and
/// never raised as this type.
#[derive(Debug, Error)]
pub enum SviError {
    #[error("config error: {0}")]
    Config(String),

    #[error("numeric error: {0}")]
    Numeric(String),
}
