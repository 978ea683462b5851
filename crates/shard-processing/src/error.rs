//! Error types for shard block processing
//!
//! Every rejection path of `ProcessBlock`, `CreateBlock` and `CommitBlock`
//! maps to exactly one variant. [`ProcessError::kind`] groups them into the
//! retry classes the caller acts on.

use shared_types::CodecError;
use thiserror::Error;

/// Shard block processing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// Header missing where one is required
    #[error("Nil block header")]
    NilBlockHeader,

    /// Body missing where one is required
    #[error("Nil block body")]
    NilBlockBody,

    /// Header was of the wrong kind (shard vs metachain)
    #[error("Wrong type assertion: expected {expected}")]
    WrongTypeAssertion { expected: &'static str },

    /// Nonce does not follow the local chain
    #[error("Wrong nonce in block: expected {expected}, got {actual}")]
    WrongNonceInBlock { expected: u64, actual: u64 },

    /// Previous hash does not match the local predecessor
    #[error("Block hash does not match")]
    BlockHashDoesNotMatch,

    /// Round not strictly greater than the predecessor's round
    #[error("Lower round in block: local {local}, received {received}")]
    LowerRoundInBlock { local: u64, received: u64 },

    /// Previous random seed does not match the predecessor's seed
    #[error("Random seed does not match")]
    RandSeedDoesNotMatch,

    /// One of the epoch transition rules failed
    #[error("Epoch does not match: {reason}")]
    EpochDoesNotMatch { reason: String },

    /// Miniblock headers and body disagree
    #[error("Header and body mismatch")]
    HeaderBodyMismatch,

    /// Deadline expired while waiting for data
    #[error("Time is out")]
    TimeIsOut,

    /// Referenced metachain header lacks enough attesting successors
    #[error("Header is not final")]
    HeaderNotFinal,

    /// Cross-shard miniblock not confirmed by any referenced metachain header
    #[error("Cross shard miniblock without confirmation from metachain")]
    CrossShardMbWithoutConfirmationFromMeta,

    /// Referenced header is not available locally
    #[error("Missing header")]
    MissingHeader,

    /// Accounts journal not empty before processing
    #[error("Account state is dirty")]
    AccountStateDirty,

    /// State root after execution differs from the header's root
    #[error("Root state does not match")]
    RootStateDoesNotMatch,

    /// Accumulated fees after execution differ from the header's fees
    #[error("Accumulated fees do not match: header {header}, computed {computed}")]
    AccumulatedFeesDoNotMatch { header: u128, computed: u128 },

    /// Header belongs to another shard
    #[error("Shard id mismatch: expected {expected}, got {actual}")]
    ShardIdMismatch { expected: u32, actual: u32 },

    /// Lookup found nothing
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Persisted unit failure
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    /// Accounts adapter failure
    #[error("Accounts error: {reason}")]
    Accounts { reason: String },

    /// Transaction coordinator rejected the body
    #[error("Transaction processing error: {reason}")]
    Transactions { reason: String },

    /// Epoch-start trigger failure
    #[error("Epoch start trigger error: {reason}")]
    EpochTrigger { reason: String },

    /// Invalid processor configuration
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Encoding or hashing failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Retry class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Block inconsistent with the local chain; never retried as-is
    Structural,
    /// Data not yet available or not yet final; retry later
    Transient,
    /// Block claims data this node cannot corroborate
    Confirmation,
    /// Caller broke a precondition
    Fatal,
    /// Collaborator (storage, accounts, codec) failed
    Infrastructure,
}

impl ErrorKind {
    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Transient => "transient",
            ErrorKind::Confirmation => "confirmation",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl ProcessError {
    /// Retry class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::WrongNonceInBlock { .. }
            | ProcessError::BlockHashDoesNotMatch
            | ProcessError::LowerRoundInBlock { .. }
            | ProcessError::RandSeedDoesNotMatch
            | ProcessError::EpochDoesNotMatch { .. }
            | ProcessError::HeaderBodyMismatch
            | ProcessError::RootStateDoesNotMatch
            | ProcessError::AccumulatedFeesDoNotMatch { .. }
            | ProcessError::ShardIdMismatch { .. } => ErrorKind::Structural,

            ProcessError::TimeIsOut | ProcessError::HeaderNotFinal => ErrorKind::Transient,

            ProcessError::CrossShardMbWithoutConfirmationFromMeta
            | ProcessError::MissingHeader => ErrorKind::Confirmation,

            ProcessError::NilBlockHeader
            | ProcessError::NilBlockBody
            | ProcessError::WrongTypeAssertion { .. }
            | ProcessError::AccountStateDirty
            | ProcessError::Config { .. } => ErrorKind::Fatal,

            ProcessError::NotFound { .. }
            | ProcessError::Storage { .. }
            | ProcessError::Accounts { .. }
            | ProcessError::Transactions { .. }
            | ProcessError::EpochTrigger { .. }
            | ProcessError::Codec(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the same block may succeed if processed again later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the predecessor should be re-requested before a retry
    pub fn needs_resync(&self) -> bool {
        matches!(self, ProcessError::BlockHashDoesNotMatch)
    }

    /// Shorthand for an epoch rule violation
    pub fn epoch_mismatch(reason: impl Into<String>) -> Self {
        ProcessError::EpochDoesNotMatch {
            reason: reason.into(),
        }
    }

    /// Shorthand for a failed lookup
    pub fn not_found(what: impl Into<String>) -> Self {
        ProcessError::NotFound { what: what.into() }
    }
}

/// Result type for block processing operations
pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ProcessError::TimeIsOut.is_retryable());
        assert!(ProcessError::HeaderNotFinal.is_retryable());
        assert!(!ProcessError::BlockHashDoesNotMatch.is_retryable());
        assert!(!ProcessError::CrossShardMbWithoutConfirmationFromMeta.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProcessError::epoch_mismatch("older epoch").kind(),
            ErrorKind::Structural
        );
        assert_eq!(ProcessError::MissingHeader.kind(), ErrorKind::Confirmation);
        assert_eq!(ProcessError::AccountStateDirty.kind(), ErrorKind::Fatal);
        assert_eq!(
            ProcessError::Codec(CodecError::Marshal("x".into())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_resync_only_on_hash_mismatch() {
        assert!(ProcessError::BlockHashDoesNotMatch.needs_resync());
        assert!(!ProcessError::RandSeedDoesNotMatch.needs_resync());
    }

    #[test]
    fn test_epoch_reason_in_message() {
        let err = ProcessError::epoch_mismatch("proposed header with epoch too high 5");
        assert!(err.to_string().contains("epoch too high 5"));
    }
}
