//! Access to the remote ledger.
//!
//! [`LedgerClient`] is the narrow surface the orchestrator and the aggregator
//! need from a node: read-only calls, log queries over a block range,
//! transaction submission and receipt lookup. Confirmation waiting and chunked
//! log scanning are built on top of it so every implementation gets the same
//! timeout and ordering semantics.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::LaunchpadError;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod retry;
pub mod rpc;

#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryLedger;
pub use retry::RetryPolicy;
pub use rpc::JsonRpcLedger;

/// One emitted event as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub removed: bool,
}

impl Log {
    /// Position of the log in ledger order.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Receipt of a mined transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub success: bool,
    /// Set for contract deployments.
    pub contract_address: Option<Address>,
    pub logs: Vec<Log>,
}

/// Transaction submitted through the node's own signer for `from`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    /// `None` deploys `data` as init code.
    pub to: Option<Address>,
    pub data: Bytes,
}

impl TransactionRequest {
    pub fn call(from: Address, to: Address, data: Bytes) -> Self {
        Self { from, to: Some(to), data }
    }

    pub fn deploy(from: Address, init_code: Bytes) -> Self {
        Self { from, to: None, data: init_code }
    }
}

/// Block a read-only call is evaluated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Latest,
    Number(u64),
}

/// How the head of the range considered immutable is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finality {
    /// The node's `finalized` block.
    Finalized,
    /// `latest` minus a fixed number of confirmations.
    Confirmations(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Evaluate a read-only call.
    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> Result<Bytes, LaunchpadError>;

    /// Logs matching `filter` for a single block range. Implementations may
    /// refuse large ranges with [`LaunchpadError::RangeTooLarge`].
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LaunchpadError>;

    async fn head(&self, finality: Finality) -> Result<u64, LaunchpadError>;

    /// Submit a transaction. Never retried: a lost response does not mean the
    /// transaction was not accepted.
    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256, LaunchpadError>;

    /// `None` while the transaction is pending or unknown.
    async fn transaction_receipt(&self, tx: B256) -> Result<Option<Receipt>, LaunchpadError>;
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Arc<T> {
    async fn call(&self, to: Address, data: Bytes, block: BlockId) -> Result<Bytes, LaunchpadError> {
        (**self).call(to, data, block).await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LaunchpadError> {
        (**self).get_logs(filter).await
    }

    async fn head(&self, finality: Finality) -> Result<u64, LaunchpadError> {
        (**self).head(finality).await
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256, LaunchpadError> {
        (**self).send_transaction(request).await
    }

    async fn transaction_receipt(&self, tx: B256) -> Result<Option<Receipt>, LaunchpadError> {
        (**self).transaction_receipt(tx).await
    }
}

/// Bounds on waiting for a submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Wait until `tx` is mined.
///
/// Returns the receipt of a successful transaction, [`LaunchpadError::Revert`]
/// for a failed one and [`LaunchpadError::ConfirmationTimeout`] when the
/// deadline passes first. A timeout says nothing about the transaction's fate.
pub async fn await_confirmation<L: LedgerClient + ?Sized>(
    ledger: &L,
    tx: B256,
    policy: &ConfirmationPolicy,
) -> Result<Receipt, LaunchpadError> {
    let poll = async {
        loop {
            match ledger.transaction_receipt(tx).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!(%tx, "transaction pending"),
                Err(err) if err.is_transient() => {
                    warn!(%tx, "receipt lookup failed, polling again: {err}")
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    };

    let receipt = match tokio::time::timeout(policy.timeout, poll).await {
        Ok(receipt) => receipt?,
        Err(_) => return Err(LaunchpadError::ConfirmationTimeout { tx }),
    };
    if !receipt.success {
        return Err(LaunchpadError::Revert { tx });
    }
    Ok(receipt)
}

/// Lazy scan of one event over `[from_block, to_block]` in bounded chunks.
///
/// Chunks come back in ascending block order and each chunk is sorted by
/// `(block_number, log_index)`, so the concatenation is in ledger order for
/// any chunk size. A chunk the node rejects as too large is halved and
/// retried; the smaller size sticks for the rest of the scan. Dropping the
/// scanner and building a new one with the same bounds restarts it.
pub struct LogScanner<'a, L: ?Sized> {
    ledger: &'a L,
    address: Address,
    topic0: B256,
    next_block: u64,
    to_block: u64,
    chunk_size: u64,
    exhausted: bool,
}

impl<'a, L: LedgerClient + ?Sized> LogScanner<'a, L> {
    pub fn new(
        ledger: &'a L,
        address: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            ledger,
            address,
            topic0,
            next_block: from_block,
            to_block,
            chunk_size: chunk_size.max(1),
            exhausted: from_block > to_block,
        }
    }

    /// Current chunk size, after any shrinking.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Fetch the next chunk, `None` once the range is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<Log>>, LaunchpadError> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let end = self
                .next_block
                .saturating_add(self.chunk_size - 1)
                .min(self.to_block);
            let filter = LogFilter {
                address: self.address,
                topic0: self.topic0,
                from_block: self.next_block,
                to_block: end,
            };
            match self.ledger.get_logs(&filter).await {
                Ok(mut logs) => {
                    logs.retain(|log| !log.removed);
                    logs.sort_by_key(Log::position);
                    debug!(
                        from = filter.from_block,
                        to = end,
                        logs = logs.len(),
                        "scanned log chunk"
                    );
                    if end == self.to_block {
                        self.exhausted = true;
                    } else {
                        self.next_block = end + 1;
                    }
                    return Ok(Some(logs));
                }
                Err(LaunchpadError::RangeTooLarge(reason)) if end > self.next_block => {
                    self.chunk_size = ((end - self.next_block + 1) / 2).max(1);
                    warn!(
                        chunk_size = self.chunk_size,
                        "node rejected log range ({reason}), shrinking chunk"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
