use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use pledge_money::{Currency, Money};
use pledge_types::{AccountId, AccountType, TransactionId};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::traits::{LedgerReader, LedgerWriter};
use crate::{EntryType, LedgerEntry, TransactionDraft, TransactionRecord};

/// In-memory ledger used for tests, local runs, and embedding.
///
/// Posting takes a single write lock, so a record's entries commit
/// together or not at all. The log is append-only; balances are
/// materialized transactionally with each post and can always be
/// re-derived from the entries.
pub struct InMemoryLedger {
    inner: RwLock<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    records: Vec<TransactionRecord>,
    by_id: HashMap<TransactionId, usize>,
    by_key: HashMap<String, TransactionId>,
    balances: HashMap<(AccountId, Currency), Decimal>,
    account_types: HashMap<AccountId, AccountType>,
    suspended: HashSet<AccountId>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerState::default()),
        }
    }

    /// Mark an account as unavailable for posting. Used to exercise the
    /// partial-distribution path and by operators to quarantine a
    /// destination.
    pub fn suspend_account(&self, account: AccountId) -> Result<(), LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::LockPoisoned)?;
        warn!(account = %account, "suspending ledger account");
        state.suspended.insert(account);
        Ok(())
    }

    pub fn restore_account(&self, account: &AccountId) -> Result<(), LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::LockPoisoned)?;
        state.suspended.remove(account);
        Ok(())
    }

    /// Recompute every record hash and chain link.
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        let mut prev_hash: Option<String> = None;
        for (index, record) in state.records.iter().enumerate() {
            let expected_seq = (index + 1) as u64;
            if record.seq != expected_seq {
                return Err(LedgerError::IntegrityViolation {
                    seq: record.seq,
                    reason: format!("expected seq {}, found {}", expected_seq, record.seq),
                });
            }
            if record.prev_hash != prev_hash {
                return Err(LedgerError::IntegrityViolation {
                    seq: record.seq,
                    reason: "previous hash link mismatch".into(),
                });
            }
            if record.compute_hash()? != record.record_hash {
                return Err(LedgerError::IntegrityViolation {
                    seq: record.seq,
                    reason: "record hash mismatch".into(),
                });
            }
            prev_hash = Some(record.record_hash.clone());
        }
        Ok(())
    }

    /// Check that every materialized balance matches the fold of the log.
    pub fn verify_balances(&self) -> Result<(), LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        let mut derived: HashMap<(AccountId, Currency), Decimal> = HashMap::new();
        for record in &state.records {
            for entry in &record.entries {
                let delta = signed_delta(entry);
                *derived
                    .entry((entry.account.clone(), entry.amount.currency.clone()))
                    .or_insert(Decimal::ZERO) += delta;
            }
        }
        for (key, materialized) in &state.balances {
            let folded = derived.get(key).copied().unwrap_or(Decimal::ZERO);
            if folded != *materialized {
                return Err(LedgerError::IntegrityViolation {
                    seq: state.records.len() as u64,
                    reason: format!(
                        "balance divergence on {}: materialized {}, derived {}",
                        key.0, materialized, folded
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn record_count(&self) -> Result<usize, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(state.records.len())
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Natural-sign balance delta for one entry: debits increase asset and
/// expense accounts, credits increase liability and revenue accounts.
fn signed_delta(entry: &LedgerEntry) -> Decimal {
    let sign = match entry.entry_type {
        EntryType::Debit => entry.account_type.debit_sign(),
        EntryType::Credit => -entry.account_type.debit_sign(),
    };
    entry.amount.amount * sign
}

impl LedgerWriter for InMemoryLedger {
    fn post(&self, draft: TransactionDraft) -> Result<TransactionRecord, LedgerError> {
        draft.validate()?;

        let mut state = self.inner.write().map_err(|_| LedgerError::LockPoisoned)?;

        if let Some(existing) = state.by_key.get(&draft.idempotency_key) {
            return Err(LedgerError::DuplicateTransaction {
                key: draft.idempotency_key.clone(),
                existing: existing.clone(),
            });
        }

        for entry in &draft.entries {
            if state.suspended.contains(&entry.account) {
                warn!(
                    account = %entry.account,
                    key = %draft.idempotency_key,
                    "posting rejected: account unavailable"
                );
                return Err(LedgerError::AccountUnavailable {
                    account: entry.account.clone(),
                });
            }
            match state.account_types.get(&entry.account) {
                Some(known) if *known != entry.account_type => {
                    return Err(LedgerError::AccountTypeConflict {
                        account: entry.account.clone(),
                    });
                }
                _ => {}
            }
        }

        let transaction_id = TransactionId::generate();
        let seq = (state.records.len() + 1) as u64;
        let prev_hash = state.records.last().map(|r| r.record_hash.clone());
        let entries: Vec<LedgerEntry> = draft
            .entries
            .iter()
            .map(|e| LedgerEntry {
                transaction_id: transaction_id.clone(),
                account: e.account.clone(),
                account_type: e.account_type,
                entry_type: e.entry_type,
                amount: e.amount.clone(),
            })
            .collect();

        let mut record = TransactionRecord {
            transaction_id: transaction_id.clone(),
            seq,
            idempotency_key: draft.idempotency_key.clone(),
            description: draft.description.clone(),
            entries,
            posted_at: Utc::now(),
            prev_hash,
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash()?;

        // Commit point: balances, indexes, and the log move together
        // under the one write lock.
        for entry in &record.entries {
            let delta = signed_delta(entry);
            *state
                .balances
                .entry((entry.account.clone(), entry.amount.currency.clone()))
                .or_insert(Decimal::ZERO) += delta;
            state
                .account_types
                .insert(entry.account.clone(), entry.account_type);
        }
        state.by_key.insert(draft.idempotency_key, transaction_id.clone());
        let index = state.records.len();
        state.by_id.insert(transaction_id.clone(), index);
        state.records.push(record.clone());

        debug!(
            transaction = %transaction_id,
            seq,
            entries = record.entries.len(),
            "posted ledger transaction"
        );
        Ok(record)
    }
}

impl LedgerReader for InMemoryLedger {
    fn account_balance(
        &self,
        account: &AccountId,
        currency: &Currency,
    ) -> Result<Money, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        let amount = state
            .balances
            .get(&(account.clone(), currency.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO);
        Ok(Money::new(amount, currency.clone()))
    }

    fn derived_balance(
        &self,
        account: &AccountId,
        currency: &Currency,
    ) -> Result<Money, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        let mut amount = Decimal::ZERO;
        for record in &state.records {
            for entry in &record.entries {
                if entry.account == *account && entry.amount.currency == *currency {
                    amount += signed_delta(entry);
                }
            }
        }
        Ok(Money::new(amount, currency.clone()))
    }

    fn transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(state
            .by_id
            .get(id)
            .and_then(|index| state.records.get(*index))
            .cloned())
    }

    fn lookup_key(&self, key: &str) -> Result<Option<TransactionId>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(state.by_key.get(key).cloned())
    }

    fn entries_for_account(&self, account: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(state
            .records
            .iter()
            .flat_map(|r| r.entries.iter())
            .filter(|e| e.account == *account)
            .cloned()
            .collect())
    }
}
