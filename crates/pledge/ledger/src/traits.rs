use pledge_money::{Currency, Money};
use pledge_types::{AccountId, TransactionId};

use crate::error::LedgerError;
use crate::{LedgerEntry, TransactionDraft, TransactionRecord};

/// Write boundary for ledger posting.
///
/// Posting is atomic per draft: all entries commit together or none do.
pub trait LedgerWriter: Send + Sync {
    fn post(&self, draft: TransactionDraft) -> Result<TransactionRecord, LedgerError>;
}

/// Read boundary for balances, lookups, and audit queries.
pub trait LedgerReader: Send + Sync {
    /// Materialized running balance for an account.
    fn account_balance(&self, account: &AccountId, currency: &Currency)
        -> Result<Money, LedgerError>;

    /// Balance derived by folding every entry for the account. Must never
    /// diverge from [`LedgerReader::account_balance`].
    fn derived_balance(&self, account: &AccountId, currency: &Currency)
        -> Result<Money, LedgerError>;

    fn transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Transaction previously posted under an idempotency key, if any.
    fn lookup_key(&self, key: &str) -> Result<Option<TransactionId>, LedgerError>;

    fn entries_for_account(&self, account: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Full ledger surface used by the distribution engine.
pub trait Ledger: LedgerWriter + LedgerReader {}

impl<T: LedgerWriter + LedgerReader> Ledger for T {}
