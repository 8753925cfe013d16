use alloy_primitives::B256;
use thiserror::Error;

/// Canonical error type for every launchpad operation.
#[derive(Debug, Error)]
pub enum LaunchpadError {
    /// Malformed, missing or out-of-range launch configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The ledger node could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single request to the ledger node timed out.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The node refused a log query because the block range or result set is too large.
    #[error("log range too large: {0}")]
    RangeTooLarge(String),

    /// JSON-RPC level error returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A payload from the ledger could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The transaction was mined but reverted.
    #[error("transaction {tx} reverted")]
    Revert { tx: B256 },

    /// The confirmation wait elapsed. The transaction may still confirm later.
    #[error("transaction {tx} not confirmed in time; outcome is uncertain, run `recover` with this hash once it settles")]
    ConfirmationTimeout { tx: B256 },

    /// The ledger reported success but the expected event or state is missing.
    #[error("transaction {tx} succeeded but {detail}; reconcile manually")]
    Consistency { tx: B256, detail: String },

    /// The operation was attempted out of state order.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The operation was already performed and must not be repeated.
    #[error("refusing to repeat: {0}")]
    IdempotencyViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchpadError {
    /// Whether retrying the same read-only request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LaunchpadError::Connection(_) | LaunchpadError::Timeout(_)
        )
    }

    /// Process exit status used by the binaries.
    pub fn exit_code(&self) -> u8 {
        match self {
            LaunchpadError::Config(_)
            | LaunchpadError::Precondition(_)
            | LaunchpadError::IdempotencyViolation(_) => 2,
            LaunchpadError::Revert { .. }
            | LaunchpadError::ConfirmationTimeout { .. }
            | LaunchpadError::Consistency { .. } => 3,
            _ => 1,
        }
    }

    /// Transaction the failure refers to, if any.
    pub fn transaction(&self) -> Option<B256> {
        match self {
            LaunchpadError::Revert { tx }
            | LaunchpadError::ConfirmationTimeout { tx }
            | LaunchpadError::Consistency { tx, .. } => Some(*tx),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LaunchpadError {
    fn from(err: serde_json::Error) -> Self {
        LaunchpadError::Decode(err.to_string())
    }
}
