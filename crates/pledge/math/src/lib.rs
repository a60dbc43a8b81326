//! Pure staking math.
//!
//! Side-effect-free functions over [`Money`] and dates: interest accrual,
//! creation/withdrawal fees, forfeiture splits, success payouts, and
//! employer matching. Input violations (non-positive principal, rates
//! outside [0, 1], mismatched currencies) fail loudly with dedicated
//! error kinds; the only silent clamp permitted is fee-versus-amount.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use pledge_money::{Money, MoneyError};
use pledge_types::{AccrualMethod, ForfeitureSplit, GoalOutcome, MatchingPolicy};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Seconds in a 365.25-day year.
const SECONDS_PER_YEAR: i64 = 31_557_600;

/// Errors raised by staking math.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MathError {
    #[error("invalid amount: {amount} (must be positive)")]
    InvalidAmount { amount: Decimal },

    #[error("invalid rate: {rate} (must be within [0, 1])")]
    InvalidRate { rate: Decimal },

    #[error("invalid apr: {apr} (must be non-negative)")]
    InvalidApr { apr: Decimal },

    #[error(transparent)]
    Money(#[from] MoneyError),
}

fn ensure_positive(money: &Money) -> Result<(), MathError> {
    if !money.is_positive() {
        warn!(amount = %money.amount, "rejected non-positive amount");
        return Err(MathError::InvalidAmount {
            amount: money.amount,
        });
    }
    Ok(())
}

fn ensure_unit_rate(rate: Decimal) -> Result<(), MathError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        warn!(%rate, "rejected rate outside [0, 1]");
        return Err(MathError::InvalidRate { rate });
    }
    Ok(())
}

fn ensure_apr(apr: Decimal) -> Result<(), MathError> {
    if apr < Decimal::ZERO {
        return Err(MathError::InvalidApr { apr });
    }
    Ok(())
}

/// Elapsed time in 365.25-day years; negative windows collapse to zero.
pub fn years_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Decimal {
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        return Decimal::ZERO;
    }
    Decimal::from(seconds) / Decimal::from(SECONDS_PER_YEAR)
}

/// `principal × apr × elapsed years`.
pub fn simple_interest(
    principal: &Money,
    apr: Decimal,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Money, MathError> {
    ensure_positive(principal)?;
    ensure_apr(apr)?;
    Ok(principal.mul_rate(apr * years_between(start, end)))
}

/// `principal × ((1 + apr/f)^(years×f) − 1)`; frequency 0 degrades to
/// simple interest.
pub fn compound_interest(
    principal: &Money,
    apr: Decimal,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    frequency: u32,
) -> Result<Money, MathError> {
    if frequency == 0 {
        return simple_interest(principal, apr, start, end);
    }
    ensure_positive(principal)?;
    ensure_apr(apr)?;

    let years = years_between(start, end);
    if years.is_zero() {
        return Ok(Money::zero(principal.currency.clone()));
    }

    let freq = Decimal::from(frequency);
    let base = Decimal::ONE + apr / freq;
    let factor = base.powd(years * freq) - Decimal::ONE;
    Ok(principal.mul_rate(factor))
}

/// Interest for one accrual method over a window.
pub fn window_interest(
    principal: &Money,
    apr: Decimal,
    method: AccrualMethod,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Money, MathError> {
    compound_interest(principal, apr, from, to, method.compounding_frequency())
}

/// Add the freshly accrued window interest to an existing accrued amount.
///
/// `to <= from` adds nothing; the result is never below `current`, which
/// is what keeps accrued amounts monotonically non-decreasing.
pub fn accrue(
    current: &Money,
    principal: &Money,
    apr: Decimal,
    method: AccrualMethod,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Money, MathError> {
    if to <= from {
        return Ok(current.clone());
    }
    let fresh = window_interest(principal, apr, method, from, to)?;
    Ok(current.add(&fresh)?)
}

/// Fee charged when a stake is created: `principal × rate`, never more
/// than the principal itself.
pub fn stake_creation_fee(principal: &Money, rate: Decimal) -> Result<Money, MathError> {
    ensure_positive(principal)?;
    ensure_unit_rate(rate)?;
    Ok(principal.mul_rate(rate).min(principal)?)
}

/// Fee charged on withdrawal: `amount × rate`, clamped to the amount.
/// A zero base amount yields a zero fee.
pub fn withdrawal_fee(amount: &Money, rate: Decimal) -> Result<Money, MathError> {
    ensure_unit_rate(rate)?;
    if amount.is_negative() {
        return Err(MathError::InvalidAmount {
            amount: amount.amount,
        });
    }
    Ok(amount.mul_rate(rate).min(amount)?)
}

/// Failure-path split of a forfeited stake's net value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitAmounts {
    pub charity: Money,
    pub app: Money,
    pub winners_pool: Money,
    /// principal + accrued − creation fee; always equals the sum of the
    /// three parts to the cent.
    pub net: Money,
}

/// Split `principal + accrued − creation_fee` per the forfeiture policy.
///
/// Charity and winners-pool shares are cent-rounded; the platform takes
/// the exact remainder, so the parts always sum to net.
pub fn forfeit_distribution(
    principal: &Money,
    accrued: &Money,
    creation_fee: &Money,
    split: &ForfeitureSplit,
) -> Result<ForfeitAmounts, MathError> {
    ensure_positive(principal)?;
    let net = principal.add(accrued)?.sub(creation_fee)?.round_cents();

    let (shares, remainder) = net.allocate(&[split.charity, split.winners]);
    let charity = shares[0].clone();
    let winners_pool = shares[1].clone();
    // The platform share is the exact remainder, so the parts sum to net
    // and any cent-rounding drift lands on the platform account.
    let app = remainder;

    Ok(ForfeitAmounts {
        charity,
        app,
        winners_pool,
        net,
    })
}

/// Success-path payout breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessPayout {
    pub principal: Money,
    pub accrued: Money,
    pub bonus: Money,
    pub fee: Money,
    /// principal + accrued + bonus − fee.
    pub net: Money,
}

/// Compute the success payout. The withdrawal fee applies to accrued
/// interest only, never to principal or bonus.
pub fn success_payout(
    principal: &Money,
    accrued: &Money,
    bonus: Option<&Money>,
    withdrawal_rate: Decimal,
) -> Result<SuccessPayout, MathError> {
    ensure_positive(principal)?;
    let bonus = bonus
        .cloned()
        .unwrap_or_else(|| Money::zero(principal.currency.clone()));
    let fee = withdrawal_fee(accrued, withdrawal_rate)?;
    let net = principal.add(accrued)?.add(&bonus)?.sub(&fee)?;
    Ok(SuccessPayout {
        principal: principal.clone(),
        accrued: accrued.clone(),
        bonus,
        fee,
        net,
    })
}

/// Employer-matching amount for a corporate stake, if the policy's
/// outcome flag permits one: `min(principal × match_percent, max_match)`.
pub fn matching_amount(
    policy: &MatchingPolicy,
    principal: &Money,
    outcome: GoalOutcome,
) -> Result<Option<Money>, MathError> {
    ensure_positive(principal)?;
    if policy.match_percent < Decimal::ZERO {
        return Err(MathError::InvalidRate {
            rate: policy.match_percent,
        });
    }

    let permitted = match outcome {
        GoalOutcome::Completed => policy.match_on_success,
        GoalOutcome::Failed => policy.match_on_failure,
    };
    if !permitted {
        return Ok(None);
    }

    let raw = principal.mul_rate(policy.match_percent);
    Ok(Some(raw.min(&policy.max_match)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pledge_money::Currency;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::usd())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn simple_interest_90_days_at_12_percent() {
        // $100 × 0.12 × (90/365.25) ≈ $2.9569
        let interest = simple_interest(
            &usd(dec!(100)),
            dec!(0.12),
            t0(),
            t0() + Duration::days(90),
        )
        .unwrap();
        assert_eq!(interest.amount.round_dp(4), dec!(2.9569));
    }

    #[test]
    fn success_payout_matches_worked_example() {
        let accrued = simple_interest(
            &usd(dec!(100)),
            dec!(0.12),
            t0(),
            t0() + Duration::days(90),
        )
        .unwrap();
        let payout = success_payout(&usd(dec!(100)), &accrued, None, dec!(0.02)).unwrap();
        assert_eq!(payout.net.amount.round_dp(3), dec!(102.898));
        // Fee is charged on accrued interest only.
        assert_eq!(payout.fee.amount, accrued.amount * dec!(0.02));
    }

    #[test]
    fn compound_frequency_zero_degrades_to_simple() {
        let end = t0() + Duration::days(200);
        let simple = simple_interest(&usd(dec!(250)), dec!(0.08), t0(), end).unwrap();
        let compound = compound_interest(&usd(dec!(250)), dec!(0.08), t0(), end, 0).unwrap();
        assert_eq!(simple, compound);
    }

    #[test]
    fn monthly_compounding_over_one_year() {
        // One exact 365.25-day year: 100 × (1.01^12 − 1) ≈ 12.6825
        let end = t0() + Duration::seconds(31_557_600);
        let interest = compound_interest(&usd(dec!(100)), dec!(0.12), t0(), end, 12).unwrap();
        let delta = (interest.amount - dec!(12.6825)).abs();
        assert!(delta < dec!(0.001), "got {}", interest.amount);
    }

    #[test]
    fn accrue_is_monotone_and_ignores_inverted_windows() {
        let current = usd(dec!(5));
        let grown = accrue(
            &current,
            &usd(dec!(100)),
            dec!(0.12),
            AccrualMethod::Simple,
            t0(),
            t0() + Duration::days(30),
        )
        .unwrap();
        assert!(grown.amount > current.amount);

        let unchanged = accrue(
            &current,
            &usd(dec!(100)),
            dec!(0.12),
            AccrualMethod::Simple,
            t0(),
            t0() - Duration::days(1),
        )
        .unwrap();
        assert_eq!(unchanged, current);
    }

    #[test]
    fn fees_reject_bad_inputs() {
        assert!(matches!(
            stake_creation_fee(&usd(dec!(0)), dec!(0.01)),
            Err(MathError::InvalidAmount { .. })
        ));
        assert!(matches!(
            stake_creation_fee(&usd(dec!(100)), dec!(1.5)),
            Err(MathError::InvalidRate { .. })
        ));
        assert!(matches!(
            withdrawal_fee(&usd(dec!(10)), dec!(-0.1)),
            Err(MathError::InvalidRate { .. })
        ));
    }

    #[test]
    fn withdrawal_fee_on_zero_amount_is_zero() {
        let fee = withdrawal_fee(&usd(dec!(0)), dec!(0.02)).unwrap();
        assert!(fee.is_zero());
    }

    #[test]
    fn group_forfeiture_splits_500_as_150_100_250() {
        let amounts = forfeit_distribution(
            &usd(dec!(500)),
            &usd(dec!(0)),
            &usd(dec!(0)),
            &ForfeitureSplit::group(),
        )
        .unwrap();
        assert_eq!(amounts.charity.amount, dec!(150));
        assert_eq!(amounts.app.amount, dec!(100));
        assert_eq!(amounts.winners_pool.amount, dec!(250));
    }

    #[test]
    fn individual_forfeiture_leaves_nothing_to_winners() {
        let amounts = forfeit_distribution(
            &usd(dec!(80)),
            &usd(dec!(2.50)),
            &usd(dec!(0.80)),
            &ForfeitureSplit::individual(),
        )
        .unwrap();
        assert!(amounts.winners_pool.is_zero());
        assert_eq!(amounts.net.amount, dec!(81.70));
        assert_eq!(
            amounts.charity.amount + amounts.app.amount,
            amounts.net.amount
        );
    }

    #[test]
    fn corporate_match_is_capped() {
        let policy = MatchingPolicy {
            corporate_account: pledge_types::CorporateAccountId::new("acme"),
            match_percent: dec!(0.5),
            max_match: usd(dec!(50)),
            match_on_success: true,
            match_on_failure: false,
        };
        let matched = matching_amount(&policy, &usd(dec!(200)), GoalOutcome::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(matched.amount, dec!(50));

        assert!(matching_amount(&policy, &usd(dec!(200)), GoalOutcome::Failed)
            .unwrap()
            .is_none());
    }

    proptest! {
        /// Forfeiture outputs sum to net to the cent for any inputs.
        #[test]
        fn forfeiture_parts_always_sum_to_net(
            principal_cents in 1i64..10_000_000,
            accrued_cents in 0i64..1_000_000,
            fee_rate_bps in 0u32..=10_000,
            group in any::<bool>(),
        ) {
            let principal = usd(Decimal::new(principal_cents, 2));
            let accrued = usd(Decimal::new(accrued_cents, 2));
            let rate = Decimal::new(fee_rate_bps as i64, 4);
            let fee = stake_creation_fee(&principal, rate).unwrap();
            let split = if group {
                ForfeitureSplit::group()
            } else {
                ForfeitureSplit::individual()
            };

            let amounts = forfeit_distribution(&principal, &accrued, &fee, &split).unwrap();
            let total = amounts.charity.amount
                + amounts.app.amount
                + amounts.winners_pool.amount;
            prop_assert_eq!(total, amounts.net.amount);
        }
    }
}
