//! Upstream ledger-query endpoints and the ordered failover pool over them.

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::Address,
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
};
use tracing::{debug, warn};

use crate::{abi::IERC20Metadata, error::IndexerError};

/// Default bound of a single request to a single endpoint.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only source of blocks, logs and token metadata.
pub trait LogSource: Send + Sync {
    /// Human-readable identifier used in errors and logs.
    fn name(&self) -> &str;

    /// Current head block number.
    fn block_number(&self) -> impl Future<Output = Result<u64, IndexerError>> + Send;

    /// Logs matching the filter, in block then log-index order.
    fn logs(&self, filter: &Filter) -> impl Future<Output = Result<Vec<Log>, IndexerError>> + Send;

    /// `decimals()` of an ERC-20 token.
    fn token_decimals(
        &self,
        token: Address,
    ) -> impl Future<Output = Result<u8, IndexerError>> + Send;
}

impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    fn name(&self) -> &str { (**self).name() }

    fn block_number(&self) -> impl Future<Output = Result<u64, IndexerError>> + Send {
        (**self).block_number()
    }

    fn logs(&self, filter: &Filter) -> impl Future<Output = Result<Vec<Log>, IndexerError>> + Send {
        (**self).logs(filter)
    }

    fn token_decimals(
        &self,
        token: Address,
    ) -> impl Future<Output = Result<u8, IndexerError>> + Send {
        (**self).token_decimals(token)
    }
}

/// JSON-RPC endpoint reached over HTTP.
#[derive(Clone, derive_more::Debug)]
pub struct RpcEndpoint {
    url: String,
    #[debug(skip)]
    provider: DynProvider,
}

impl RpcEndpoint {
    pub fn connect(url: &str) -> Result<Self, IndexerError> {
        let parsed = url
            .parse()
            .map_err(|e| IndexerError::InvalidArgument(format!("invalid RPC URL {url:?}: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(parsed).erased();
        Ok(Self { url: url.to_string(), provider })
    }
}

impl LogSource for RpcEndpoint {
    fn name(&self) -> &str { &self.url }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| IndexerError::from_transport(&self.url, e))
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, IndexerError> {
        self.provider.get_logs(filter).await.map_err(|e| IndexerError::from_transport(&self.url, e))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, IndexerError> {
        IERC20Metadata::new(token, self.provider.clone())
            .decimals()
            .call()
            .await
            .map_err(|e| match e {
                alloy::contract::Error::TransportError(e) => {
                    IndexerError::from_transport(&self.url, e)
                },
                other => IndexerError::Contract(other),
            })
    }
}

/// Ordered list of endpoints with per-call failover.
///
/// Every call starts over from the first endpoint; nothing about earlier
/// failures is remembered. Each attempt is bounded by the pool's timeout so a
/// hanging endpoint costs at most that long before the next one is tried.
#[derive(Debug)]
pub struct EndpointPool<S> {
    endpoints: Vec<S>,
    timeout: Duration,
}

impl<S: LogSource> EndpointPool<S> {
    pub fn new(endpoints: Vec<S>, timeout: Duration) -> Result<Self, IndexerError> {
        if endpoints.is_empty() {
            return Err(IndexerError::InvalidArgument("endpoint pool is empty".to_string()));
        }
        if timeout.is_zero() {
            return Err(IndexerError::InvalidArgument("endpoint timeout is zero".to_string()));
        }
        Ok(Self { endpoints, timeout })
    }

    pub async fn block_number(&self) -> Result<u64, IndexerError> {
        self.call("eth_blockNumber", |s| s.block_number()).await
    }

    pub async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, IndexerError> {
        self.call("eth_getLogs", |s| s.logs(filter)).await
    }

    pub async fn token_decimals(&self, token: Address) -> Result<u8, IndexerError> {
        self.call("eth_call", |s| s.token_decimals(token)).await
    }

    async fn call<'a, T, F, Fut>(&'a self, method: &str, request: F) -> Result<T, IndexerError>
    where
        F: Fn(&'a S) -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut last = None;
        for endpoint in &self.endpoints {
            let err = match tokio::time::timeout(self.timeout, request(endpoint)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => IndexerError::Timeout {
                    endpoint: endpoint.name().to_string(),
                    timeout_ms: self.timeout.as_millis(),
                },
            };
            warn!(endpoint = endpoint.name(), method, error = %err, "endpoint failed, trying next");
            last = Some(err);
        }
        debug!(method, attempted = self.endpoints.len(), "all endpoints failed");
        Err(IndexerError::AllEndpointsExhausted {
            attempted: self.endpoints.len(),
            last: Box::new(last.unwrap_or_else(|| {
                IndexerError::InvalidArgument("endpoint pool is empty".to_string())
            })),
        })
    }
}

impl EndpointPool<RpcEndpoint> {
    /// Connects to every URL, keeping their order.
    pub fn connect<I, U>(urls: I, timeout: Duration) -> Result<Self, IndexerError>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let endpoints = urls
            .into_iter()
            .map(|url| RpcEndpoint::connect(url.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints, timeout)
    }
}
