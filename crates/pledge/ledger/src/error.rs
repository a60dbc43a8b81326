use pledge_money::Currency;
use pledge_types::{AccountId, TransactionId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors returned by ledger interfaces.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Debits and credits differ for a currency. Always a programming
    /// defect in the caller, never user-recoverable.
    #[error("unbalanced transaction in {currency}: debits {debits} != credits {credits}")]
    UnbalancedTransaction {
        currency: Currency,
        debits: Decimal,
        credits: Decimal,
    },

    #[error("transaction has no entries")]
    EmptyTransaction,

    #[error("entry amount {amount} must be positive")]
    NonPositiveEntry { amount: Decimal },

    #[error("idempotency key '{key}' already posted as {existing}")]
    DuplicateTransaction {
        key: String,
        existing: TransactionId,
    },

    #[error("account {account} is unavailable for posting")]
    AccountUnavailable { account: AccountId },

    #[error("account {account} was posted with conflicting account types")]
    AccountTypeConflict { account: AccountId },

    #[error("transaction {0} not found")]
    UnknownTransaction(TransactionId),

    #[error("ledger state lock poisoned")]
    LockPoisoned,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ledger integrity violation at seq {seq}: {reason}")]
    IntegrityViolation { seq: u64, reason: String },
}
