//! Shared identifiers, the chart of accounts, and policy structs.
//!
//! Everything here is an opaque input to the engine: user, goal, group,
//! charity, and corporate identifiers come from out-of-scope collaborators,
//! and the policy structs (fee defaults, forfeiture splits, matching rules)
//! are supplied by configuration. The engine consumes them; it never
//! resolves or validates them for business plausibility.

#![deny(unsafe_code)]

use pledge_money::Money;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Goal identifier owned by the goal service.
    GoalId, "goal");
string_id!(
    /// User identifier owned by the profile service.
    UserId, "user");
string_id!(StakeId, "stake");
string_id!(EscrowId, "escrow");
string_id!(GroupId, "group");
string_id!(CharityId, "charity");
string_id!(CorporateAccountId, "corp");
string_id!(DisputeId, "dispute");
string_id!(
    /// Reference to one posted ledger transaction.
    TransactionId, "txn");

/// Ledger account identifier.
///
/// Constructors encode the chart of accounts so every crate derives the
/// same account id for the same party.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A user's wallet account.
    pub fn wallet(user: &UserId) -> Self {
        Self(format!("wallet:{}", user))
    }

    /// The holding account for one escrow.
    pub fn escrow(escrow: &EscrowId) -> Self {
        Self(format!("escrow:{}", escrow))
    }

    pub fn charity(charity: &CharityId) -> Self {
        Self(format!("charity:{}", charity))
    }

    pub fn corporate(corporate: &CorporateAccountId) -> Self {
        Self(format!("corporate:{}", corporate))
    }

    /// Platform fee revenue account.
    pub fn platform_revenue() -> Self {
        Self("platform:revenue".to_string())
    }

    /// Platform expense account that funds interest accrual.
    pub fn interest_expense() -> Self {
        Self("platform:interest-expense".to_string())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account classification. Debits increase Asset/Expense accounts;
/// credits increase Liability/Revenue accounts. The balanced-transaction
/// invariant holds regardless of type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Asset,
    Liability,
    Revenue,
    Expense,
}

impl AccountType {
    /// Sign applied to a debit when folding a balance; credits get the
    /// opposite sign.
    pub fn debit_sign(&self) -> Decimal {
        match self {
            AccountType::Asset | AccountType::Expense => Decimal::ONE,
            AccountType::Liability | AccountType::Revenue => Decimal::NEGATIVE_ONE,
        }
    }
}

/// How interest compounds on a stake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccrualMethod {
    Simple,
    Compound,
    Daily,
    Weekly,
    Monthly,
}

impl AccrualMethod {
    /// Compounding periods per year; zero means simple interest.
    pub fn compounding_frequency(&self) -> u32 {
        match self {
            AccrualMethod::Simple => 0,
            AccrualMethod::Compound => 1,
            AccrualMethod::Daily => 365,
            AccrualMethod::Weekly => 52,
            AccrualMethod::Monthly => 12,
        }
    }
}

/// Annual percentage rate model for a stake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AprModel {
    /// A fixed annual rate, e.g. `0.12` for 12%.
    Fixed(Decimal),
}

impl AprModel {
    pub fn annual_rate(&self) -> Decimal {
        match self {
            AprModel::Fixed(rate) => *rate,
        }
    }
}

/// Terminal outcome of a goal, supplied by the goal service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalOutcome {
    Completed,
    Failed,
}

/// Which forfeiture policy applies when a goal fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForfeitType {
    Individual,
    Group,
    Corporate,
}

/// Forfeiture split ratios. The three fractions must sum to one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitureSplit {
    pub charity: Decimal,
    pub app: Decimal,
    pub winners: Decimal,
}

impl ForfeitureSplit {
    /// 50% charity, 50% platform, nothing back to the user.
    pub fn individual() -> Self {
        Self {
            charity: Decimal::new(5, 1),
            app: Decimal::new(5, 1),
            winners: Decimal::ZERO,
        }
    }

    /// 30% charity, 20% platform, 50% redistributed to winning members.
    pub fn group() -> Self {
        Self {
            charity: Decimal::new(3, 1),
            app: Decimal::new(2, 1),
            winners: Decimal::new(5, 1),
        }
    }

    pub fn for_type(forfeit_type: ForfeitType) -> Self {
        match forfeit_type {
            ForfeitType::Individual | ForfeitType::Corporate => Self::individual(),
            ForfeitType::Group => Self::group(),
        }
    }
}

/// Distribution plan type, mirroring the goal's sponsorship model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanType {
    Individual,
    Group,
    Corporate,
}

impl PlanType {
    pub fn forfeit_type(&self) -> ForfeitType {
        match self {
            PlanType::Individual => ForfeitType::Individual,
            PlanType::Group => ForfeitType::Group,
            PlanType::Corporate => ForfeitType::Corporate,
        }
    }
}

/// One winner's share of a group pot, in percent (not a fraction).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerShare {
    pub user_id: UserId,
    pub share_percent: Decimal,
}

/// How a finished goal's escrow resolves into ledger postings.
///
/// Winners may be populated late (after the goal, based on actual
/// performance), so percentage validation happens at distribution time,
/// not at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub goal_id: GoalId,
    pub plan_type: PlanType,
    pub charity_percent: Decimal,
    pub app_percent: Decimal,
    pub winners: Vec<WinnerShare>,
    pub charity_id: Option<CharityId>,
}

impl DistributionPlan {
    /// charity + app + Σ winner shares, in percent.
    pub fn percent_total(&self) -> Decimal {
        self.charity_percent
            + self.app_percent
            + self
                .winners
                .iter()
                .map(|w| w.share_percent)
                .sum::<Decimal>()
    }
}

/// Employer matching policy for corporate-sponsored stakes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPolicy {
    pub corporate_account: CorporateAccountId,
    /// Fraction of principal matched, e.g. `0.5`.
    pub match_percent: Decimal,
    /// Hard cap on the matched amount.
    pub max_match: Money,
    pub match_on_success: bool,
    pub match_on_failure: bool,
}

/// Engine configuration supplied by the caller. Never resolved from
/// globals; see the explicit-DI rule in the design notes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StakingConfig {
    pub default_fee_rate_on_stake: Decimal,
    pub default_fee_rate_on_withdrawal: Decimal,
    pub default_apr: Decimal,
    /// Days an Active stake may run before automatic liquidation.
    pub liquidation_after_days: i64,
    /// Accepted deviation, in percentage points, of a plan's total from 100.
    pub plan_tolerance: Decimal,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            default_fee_rate_on_stake: Decimal::new(1, 2),       // 1%
            default_fee_rate_on_withdrawal: Decimal::new(2, 2),  // 2%
            default_apr: Decimal::new(12, 2),                    // 12%
            liquidation_after_days: 365,
            plan_tolerance: Decimal::new(1, 2), // 0.01
        }
    }
}

/// Config-level validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rate {rate} for {field} is outside [0, 1]")]
    RateOutOfRange { field: String, rate: Decimal },
}

impl StakingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, rate) in [
            ("default_fee_rate_on_stake", self.default_fee_rate_on_stake),
            (
                "default_fee_rate_on_withdrawal",
                self.default_fee_rate_on_withdrawal,
            ),
        ] {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(ConfigError::RateOutOfRange {
                    field: field.to_string(),
                    rate,
                });
            }
        }
        Ok(())
    }
}
