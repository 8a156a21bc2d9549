use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),
    #[error("upstream proxy failure: {0}")]
    UpstreamProxy(String),
    #[error("origin request timed out")]
    OriginTimeout,
    #[error("TLS setup failed: {0}")]
    Tls(#[from] proxywoman_tls::TlsError),
    #[error("interceptor failure: {0}")]
    Rule(#[from] proxywoman_rules::RuleError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
