use alloy::transports::{RpcError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Endpoint unreachable, connection reset, malformed HTTP response.
    #[error("transport failure at {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Endpoint answered with a well-formed JSON-RPC error payload
    /// (rate limit, block range too wide, etc.).
    #[error("protocol error at {endpoint}: {code} {message}")]
    Protocol { endpoint: String, code: i64, message: String },

    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u128 },

    #[error("all {attempted} endpoints failed, last error: {last}")]
    AllEndpointsExhausted { attempted: usize, last: Box<IndexerError> },

    #[error("malformed log in tx {tx_hash}: {reason}")]
    MalformedLog { tx_hash: String, reason: String },

    /// The fixed-point scale of an amount is unknown or contradicts the chain.
    /// Never guessed: a wrong scale silently produces values off by orders of
    /// magnitude.
    #[error("scale ambiguity: {0}")]
    ScaleAmbiguity(String),

    #[error("decimal error: {0}")]
    Decimal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("contract call failed: {0}")]
    Contract(#[from] alloy::contract::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl IndexerError {
    /// Classifies an alloy transport error raised while talking to `endpoint`.
    pub fn from_transport(endpoint: &str, err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => IndexerError::Protocol {
                endpoint: endpoint.to_string(),
                code: payload.code,
                message: payload.message.to_string(),
            },
            other => IndexerError::Transport {
                endpoint: endpoint.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Whether the failure came from talking to an upstream endpoint and is
    /// therefore worth retrying later.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            IndexerError::Transport { .. }
                | IndexerError::Protocol { .. }
                | IndexerError::Timeout { .. }
                | IndexerError::AllEndpointsExhausted { .. }
        )
    }
}
