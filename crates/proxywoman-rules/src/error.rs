use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("breakpoint session not found: {0}")]
    SessionNotFound(String),
    #[error("breakpoint cancelled")]
    BreakpointCancelled,
    #[error("local file not found: {0}")]
    LocalFileMissing(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("upstream proxy test failed: {0}")]
    UpstreamTest(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
