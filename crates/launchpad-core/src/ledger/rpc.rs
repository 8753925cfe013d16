use std::future::Future;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{
    BlockId as RpcBlockId, BlockNumberOrTag, Filter, Log as RpcLog, TransactionInput, TransactionReceipt,
    TransactionRequest as RpcTransactionRequest,
};
use alloy::transports::http::Http;
use alloy::transports::{RpcError, TransportError};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::trace;

use super::{BlockId, Finality, LedgerClient, Log, LogFilter, Receipt, RetryPolicy, TransactionRequest};
use crate::error::LaunchpadError;

/// Phrases providers use when they throttle a client. Some of them report
/// throttling with the same `-32005` code as an oversized log query.
const RATE_LIMITED: &[&str] = &[
    "rate limit",
    "too many requests",
    "compute units",
    "request limit",
    "capacity exceeded",
];

/// Phrases for a log query whose block range or result set is too large.
const RANGE_LIMITED: &[&str] = &[
    "block range",
    "range too large",
    "range is too large",
    "query returned more than",
    "too many results",
    "response size",
    "log response size exceeded",
];

type HttpProvider = RootProvider<Http<reqwest::Client>>;

/// [`LedgerClient`] over an EVM node's JSON-RPC HTTP endpoint.
///
/// Every request is bounded by `request_timeout`. Reads are retried on
/// transport failures and throttling; submissions are not.
pub struct JsonRpcLedger {
    provider: HttpProvider,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl JsonRpcLedger {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, LaunchpadError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(LaunchpadError::Config("RPC endpoint is empty".into()));
        }
        let endpoint: reqwest::Url = url
            .parse()
            .map_err(|err| LaunchpadError::Config(format!("RPC endpoint {url:?}: {err}")))?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(endpoint),
            request_timeout,
            retry: RetryPolicy::default(),
        })
    }

    async fn attempt<T>(
        &self,
        method: &'static str,
        request: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, LaunchpadError> {
        trace!(method, "rpc request");
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(|err| rpc_error(method, err)),
            Err(_) => Err(LaunchpadError::Timeout(format!(
                "{method}: no response within {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn read<T, F, Fut>(&self, method: &'static str, request: F) -> Result<T, LaunchpadError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.retry
            .retry_if(|_| self.attempt(method, request()), LaunchpadError::is_transient)
            .await
    }
}

fn rpc_error(method: &str, err: TransportError) -> LaunchpadError {
    match err {
        RpcError::ErrorResp(payload) => classify(method, payload.code, &payload.message),
        RpcError::DeserError { err, .. } => LaunchpadError::Decode(format!("{method}: {err}")),
        RpcError::NullResp => LaunchpadError::Decode(format!("{method}: null response")),
        other => LaunchpadError::Connection(format!("{method}: {other}")),
    }
}

/// Map a node's error object onto the error kinds the scanner and the retry
/// policy act on.
fn classify(method: &str, code: i64, message: &str) -> LaunchpadError {
    let lower = message.to_ascii_lowercase();
    if RATE_LIMITED.iter().any(|phrase| lower.contains(phrase)) {
        LaunchpadError::Connection(format!("{method}: throttled by the node ({code}: {message})"))
    } else if RANGE_LIMITED.iter().any(|phrase| lower.contains(phrase)) {
        LaunchpadError::RangeTooLarge(message.to_string())
    } else {
        LaunchpadError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

fn missing(method: &str, field: &str) -> LaunchpadError {
    LaunchpadError::Decode(format!("{method}: {field} missing"))
}

fn from_rpc_log(log: &RpcLog) -> Result<Log, LaunchpadError> {
    Ok(Log {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log.block_number.ok_or_else(|| missing("log", "blockNumber"))?,
        transaction_hash: log.transaction_hash.ok_or_else(|| missing("log", "transactionHash"))?,
        log_index: log.log_index.ok_or_else(|| missing("log", "logIndex"))?,
        removed: log.removed,
    })
}

fn from_rpc_receipt(receipt: &TransactionReceipt) -> Result<Receipt, LaunchpadError> {
    Ok(Receipt {
        transaction_hash: receipt.transaction_hash,
        block_number: receipt
            .block_number
            .ok_or_else(|| missing("receipt", "blockNumber"))?,
        success: receipt.status(),
        contract_address: receipt.contract_address,
        logs: receipt
            .inner
            .logs()
            .iter()
            .map(from_rpc_log)
            .collect::<Result<_, _>>()?,
    })
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> Result<Bytes, LaunchpadError> {
        let tx = RpcTransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(data));
        let block = match block {
            BlockId::Latest => RpcBlockId::latest(),
            BlockId::Number(number) => RpcBlockId::number(number),
        };
        let tx = &tx;
        self.read("eth_call", || async move { self.provider.call(tx).block(block).await })
            .await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LaunchpadError> {
        let query = Filter::new()
            .address(filter.address)
            .event_signature(filter.topic0)
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        let query = &query;
        let logs = self
            .read("eth_getLogs", || async move { self.provider.get_logs(query).await })
            .await?;
        logs.iter().map(from_rpc_log).collect()
    }

    async fn head(&self, finality: Finality) -> Result<u64, LaunchpadError> {
        match finality {
            Finality::Finalized => {
                let block = self
                    .read("eth_getBlockByNumber", || async move {
                        self.provider
                            .get_block_by_number(BlockNumberOrTag::Finalized, false.into())
                            .await
                    })
                    .await?
                    .ok_or_else(|| LaunchpadError::Decode("node has no finalized block".into()))?;
                Ok(block.header.number)
            }
            Finality::Confirmations(depth) => {
                let latest = self
                    .read("eth_blockNumber", || async move { self.provider.get_block_number().await })
                    .await?;
                Ok(latest.saturating_sub(depth))
            }
        }
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256, LaunchpadError> {
        let mut tx = RpcTransactionRequest::default()
            .from(request.from)
            .input(TransactionInput::both(request.data));
        if let Some(to) = request.to {
            tx = tx.to(to);
        }
        let pending = self
            .attempt("eth_sendTransaction", self.provider.send_transaction(tx))
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx: B256) -> Result<Option<Receipt>, LaunchpadError> {
        let receipt = self
            .read("eth_getTransactionReceipt", || async move {
                self.provider.get_transaction_receipt(tx).await
            })
            .await?;
        receipt.as_ref().map(from_rpc_receipt).transpose()
    }
}
