//! Append-only double-entry ledger.
//!
//! Every financial event in the engine becomes one balanced
//! [`TransactionRecord`]: a set of debit/credit entries whose totals match
//! per currency. Records are hash-chained and never mutated or deleted.
//! State transitions that move money must post here first.

#![deny(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pledge_money::{Currency, Money};
use pledge_types::{AccountId, AccountType, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod memory;
pub mod traits;

pub use error::LedgerError;
pub use memory::InMemoryLedger;
pub use traits::{Ledger, LedgerReader, LedgerWriter};

/// Debit or credit polarity of one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
}

/// One debit or credit line against an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: TransactionId,
    pub account: AccountId,
    pub account_type: AccountType,
    pub entry_type: EntryType,
    pub amount: Money,
}

/// An entry before it is bound to a posted transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftEntry {
    pub account: AccountId,
    pub account_type: AccountType,
    pub entry_type: EntryType,
    pub amount: Money,
}

/// A transaction being assembled for posting.
///
/// Drafts carry an idempotency key so retries of the same logical leg can
/// be recognized instead of posted twice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub idempotency_key: String,
    pub description: String,
    pub entries: Vec<DraftEntry>,
}

impl TransactionDraft {
    pub fn new(idempotency_key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            description: description.into(),
            entries: Vec::new(),
        }
    }

    pub fn debit(mut self, account: AccountId, account_type: AccountType, amount: Money) -> Self {
        self.entries.push(DraftEntry {
            account,
            account_type,
            entry_type: EntryType::Debit,
            amount,
        });
        self
    }

    pub fn credit(mut self, account: AccountId, account_type: AccountType, amount: Money) -> Self {
        self.entries.push(DraftEntry {
            account,
            account_type,
            entry_type: EntryType::Credit,
            amount,
        });
        self
    }

    /// Enforce the fundamental invariant: entries exist, every amount is
    /// positive, and debits equal credits per currency.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.entries.is_empty() {
            return Err(LedgerError::EmptyTransaction);
        }

        let mut per_currency: HashMap<Currency, (Decimal, Decimal)> = HashMap::new();
        for entry in &self.entries {
            if !entry.amount.is_positive() {
                return Err(LedgerError::NonPositiveEntry {
                    amount: entry.amount.amount,
                });
            }
            let slot = per_currency
                .entry(entry.amount.currency.clone())
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            match entry.entry_type {
                EntryType::Debit => slot.0 += entry.amount.amount,
                EntryType::Credit => slot.1 += entry.amount.amount,
            }
        }

        for (currency, (debits, credits)) in per_currency {
            if debits != credits {
                return Err(LedgerError::UnbalancedTransaction {
                    currency,
                    debits,
                    credits,
                });
            }
        }
        Ok(())
    }
}

/// A durably posted, hash-chained transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    /// Position in the append-only log, starting at 1.
    pub seq: u64,
    pub idempotency_key: String,
    pub description: String,
    pub entries: Vec<LedgerEntry>,
    pub posted_at: DateTime<Utc>,
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl TransactionRecord {
    /// Recompute this record's hash from its content and chain position.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let material = serde_json::json!({
            "transaction_id": self.transaction_id,
            "seq": self.seq,
            "idempotency_key": self.idempotency_key,
            "description": self.description,
            "entries": self.entries,
            "posted_at": self.posted_at,
            "prev_hash": self.prev_hash,
        });
        let bytes = serde_json::to_vec(&material)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
