//! In-memory computation of distribution legs.
//!
//! A leg is one balanced transaction draft with a deterministic
//! idempotency key. Legs are computed fully in memory before anything is
//! posted, and the same inputs always produce the same keys and amounts,
//! which is what lets a reconciliation resume from the first unposted
//! leg without re-posting completed ones.

use pledge_escrow::{Escrow, Stakeholder};
use pledge_ledger::TransactionDraft;
use pledge_math::{self, ForfeitAmounts};
use pledge_money::Money;
use pledge_stake::Stake;
use pledge_types::{
    AccountId, AccountType, CharityId, DistributionPlan, ForfeitureSplit, GoalOutcome,
    MatchingPolicy, PlanType, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DistributionError;

/// What a leg pays for. Part of the idempotency key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegPurpose {
    AccrualFunding,
    Payout,
    Bonus,
    WithdrawalFee,
    CreationFee,
    Charity,
    Platform,
    WinnerShare,
    CorporateMatch,
    Refund,
}

impl LegPurpose {
    fn key_fragment(&self) -> &'static str {
        match self {
            LegPurpose::AccrualFunding => "accrual",
            LegPurpose::Payout => "payout",
            LegPurpose::Bonus => "bonus",
            LegPurpose::WithdrawalFee => "withdrawal-fee",
            LegPurpose::CreationFee => "creation-fee",
            LegPurpose::Charity => "charity",
            LegPurpose::Platform => "platform",
            LegPurpose::WinnerShare => "winner",
            LegPurpose::CorporateMatch => "match",
            LegPurpose::Refund => "refund",
        }
    }
}

/// One balanced transaction draft within a distribution.
#[derive(Clone, Debug)]
pub struct DistributionLeg {
    pub purpose: LegPurpose,
    pub idempotency_key: String,
    pub draft: TransactionDraft,
}

fn leg_key(escrow: &Escrow, purpose: LegPurpose, qualifier: Option<&str>) -> String {
    match qualifier {
        Some(q) => format!("dist:{}:{}:{}", escrow.id, purpose.key_fragment(), q),
        None => format!("dist:{}:{}", escrow.id, purpose.key_fragment()),
    }
}

fn transfer_leg(
    escrow: &Escrow,
    purpose: LegPurpose,
    qualifier: Option<&str>,
    description: String,
    from: (AccountId, AccountType),
    to: (AccountId, AccountType),
    amount: Money,
) -> DistributionLeg {
    let key = leg_key(escrow, purpose, qualifier);
    let draft = TransactionDraft::new(key.clone(), description)
        .debit(from.0, from.1, amount.clone())
        .credit(to.0, to.1, amount);
    DistributionLeg {
        purpose,
        idempotency_key: key,
        draft,
    }
}

fn escrow_account(escrow: &Escrow) -> (AccountId, AccountType) {
    (AccountId::escrow(&escrow.id), AccountType::Liability)
}

fn wallet_account(user: &UserId) -> (AccountId, AccountType) {
    (AccountId::wallet(user), AccountType::Liability)
}

fn platform_account() -> (AccountId, AccountType) {
    (AccountId::platform_revenue(), AccountType::Revenue)
}

fn interest_account() -> (AccountId, AccountType) {
    (AccountId::interest_expense(), AccountType::Expense)
}

/// Charity destination for forfeitures. Falls back to the platform
/// account when no charity is designated, so funds are never stranded.
fn charity_account(charity: Option<&CharityId>, escrow: &Escrow) -> (AccountId, AccountType) {
    match charity {
        Some(id) => (AccountId::charity(id), AccountType::Liability),
        None => {
            warn!(escrow = %escrow.id, "no charity designated; routing charity share to platform");
            platform_account()
        }
    }
}

/// Interest enters the escrow account from the platform's interest
/// expense before any payout leg, so every later outflow is covered.
fn accrual_leg(escrow: &Escrow, accrued: &Money) -> Option<DistributionLeg> {
    if !accrued.is_positive() {
        return None;
    }
    Some(transfer_leg(
        escrow,
        LegPurpose::AccrualFunding,
        None,
        format!("interest accrual for escrow {}", escrow.id),
        interest_account(),
        escrow_account(escrow),
        accrued.clone(),
    ))
}

/// Aggregate creation fee across stakeholders, cent-rounded.
fn total_creation_fee(
    escrow: &Escrow,
    stakes: &[Stake],
) -> Result<Money, DistributionError> {
    let mut total = Money::zero(escrow.currency.clone());
    for stakeholder in &escrow.stakeholders {
        let stake = stake_for(stakes, stakeholder)?;
        let fee = pledge_math::stake_creation_fee(&stakeholder.principal, stake.fee_rate_on_stake)?;
        total = total.add(&fee)?;
    }
    Ok(total.round_cents())
}

fn stake_for<'a>(
    stakes: &'a [Stake],
    stakeholder: &Stakeholder,
) -> Result<&'a Stake, DistributionError> {
    stakes
        .iter()
        .find(|s| s.id == stakeholder.stake_id)
        .ok_or_else(|| {
            DistributionError::Stake(pledge_stake::StakeError::NotFound(
                stakeholder.stake_id.clone(),
            ))
        })
}

/// Cent-rounded shares can exceed the total they were cut from, leaving
/// a negative remainder. Claw the difference back out of the shares,
/// largest first, so the shares never pay out more than the total. The
/// returned remainder is never negative.
fn absorb_drift(shares: &mut [Money], remainder: Money) -> Result<Money, DistributionError> {
    if !remainder.is_negative() {
        return Ok(remainder);
    }
    let zero = Money::zero(remainder.currency.clone());
    let mut deficit = zero.sub(&remainder)?;
    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|a, b| shares[*b].amount.cmp(&shares[*a].amount));
    for index in order {
        if !deficit.is_positive() {
            break;
        }
        let take = shares[index].min(&deficit)?;
        shares[index] = shares[index].sub(&take)?;
        deficit = deficit.sub(&take)?;
    }
    Ok(zero)
}

/// Compute the full leg set for a finished goal.
pub fn build_legs(
    escrow: &Escrow,
    stakes: &[Stake],
    plan: &DistributionPlan,
    outcome: GoalOutcome,
    matching: Option<&MatchingPolicy>,
) -> Result<Vec<DistributionLeg>, DistributionError> {
    // Individual and corporate plans pay a single stakeholder; a wider
    // escrow would misroute the other stakes' principal.
    if matches!(plan.plan_type, PlanType::Individual | PlanType::Corporate)
        && escrow.stakeholders.len() != 1
    {
        return Err(DistributionError::PlanStakeholderMismatch {
            goal_id: escrow.goal_id.clone(),
            stakeholders: escrow.stakeholders.len(),
        });
    }

    let accrued = escrow.accrued_amount.round_cents();
    let mut legs = Vec::new();
    legs.extend(accrual_leg(escrow, &accrued));

    // The plan's charity wins; a stake-level designation is the fallback.
    let stake_charity = escrow
        .stakeholders
        .first()
        .and_then(|sh| stake_for(stakes, sh).ok())
        .and_then(|s| s.charity_id.as_ref());
    let charity_id = plan.charity_id.as_ref().or(stake_charity);

    match (plan.plan_type, outcome) {
        (PlanType::Individual | PlanType::Corporate, GoalOutcome::Completed) => {
            individual_success_legs(escrow, stakes, &accrued, &mut legs)?;
        }
        (PlanType::Individual | PlanType::Corporate, GoalOutcome::Failed) => {
            forfeiture_legs(
                escrow,
                stakes,
                plan,
                charity_id,
                &accrued,
                &ForfeitureSplit::individual(),
                &mut legs,
            )?;
        }
        (PlanType::Group, GoalOutcome::Completed) => {
            group_success_legs(escrow, plan, charity_id, &accrued, &mut legs)?;
        }
        (PlanType::Group, GoalOutcome::Failed) => {
            forfeiture_legs(
                escrow,
                stakes,
                plan,
                charity_id,
                &accrued,
                &ForfeitureSplit::group(),
                &mut legs,
            )?;
        }
    }

    if plan.plan_type == PlanType::Corporate {
        if let Some(policy) = matching {
            legs.extend(matching_leg(escrow, policy, outcome)?);
        }
    }

    Ok(legs)
}

/// Net payout to the single stakeholder, fee on accrued interest only,
/// optional early-completion bonus funded by the platform.
fn individual_success_legs(
    escrow: &Escrow,
    stakes: &[Stake],
    accrued: &Money,
    legs: &mut Vec<DistributionLeg>,
) -> Result<(), DistributionError> {
    let stakeholder = &escrow.stakeholders[0];
    let stake = stake_for(stakes, stakeholder)?;

    let payout = pledge_math::success_payout(
        &escrow.total_principal,
        accrued,
        stake.early_completion_bonus.as_ref(),
        stake.fee_rate_on_withdrawal,
    )?;
    let fee = payout.fee.round_cents();
    let from_escrow = escrow.total_principal.add(accrued)?.sub(&fee)?;

    if from_escrow.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::Payout,
            Some(&stakeholder.user_id.0),
            format!("success payout for goal {}", escrow.goal_id),
            escrow_account(escrow),
            wallet_account(&stakeholder.user_id),
            from_escrow,
        ));
    }
    if fee.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::WithdrawalFee,
            None,
            format!("withdrawal fee for goal {}", escrow.goal_id),
            escrow_account(escrow),
            platform_account(),
            fee,
        ));
    }
    if payout.bonus.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::Bonus,
            Some(&stakeholder.user_id.0),
            format!("early completion bonus for goal {}", escrow.goal_id),
            interest_account(),
            wallet_account(&stakeholder.user_id),
            payout.bonus.round_cents(),
        ));
    }
    Ok(())
}

/// Group success: the pot splits per the validated plan percentages;
/// the platform absorbs the rounding remainder.
fn group_success_legs(
    escrow: &Escrow,
    plan: &DistributionPlan,
    charity_id: Option<&CharityId>,
    accrued: &Money,
    legs: &mut Vec<DistributionLeg>,
) -> Result<(), DistributionError> {
    let pot = escrow.total_principal.add(accrued)?;
    let hundred = Decimal::ONE_HUNDRED;

    let mut weights = vec![plan.charity_percent / hundred];
    for winner in &plan.winners {
        weights.push(winner.share_percent / hundred);
    }
    let (mut shares, remainder) = pot.allocate(&weights);
    let remainder = absorb_drift(&mut shares, remainder)?;

    let charity_share = shares[0].clone();
    if charity_share.is_positive() {
        let destination = charity_account(charity_id, escrow);
        legs.push(transfer_leg(
            escrow,
            LegPurpose::Charity,
            None,
            format!("charity share for goal {}", escrow.goal_id),
            escrow_account(escrow),
            destination,
            charity_share,
        ));
    }

    for (winner, share) in plan.winners.iter().zip(shares.iter().skip(1)) {
        if share.is_positive() {
            legs.push(transfer_leg(
                escrow,
                LegPurpose::WinnerShare,
                Some(&winner.user_id.0),
                format!("winner share for goal {}", escrow.goal_id),
                escrow_account(escrow),
                wallet_account(&winner.user_id),
                share.clone(),
            ));
        }
    }

    // App percent plus all rounding drift.
    if remainder.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::Platform,
            None,
            format!("platform share for goal {}", escrow.goal_id),
            escrow_account(escrow),
            platform_account(),
            remainder,
        ));
    }
    Ok(())
}

/// Failure path: split net value per the forfeiture policy and empty the
/// escrow account exactly.
fn forfeiture_legs(
    escrow: &Escrow,
    stakes: &[Stake],
    plan: &DistributionPlan,
    charity_id: Option<&CharityId>,
    accrued: &Money,
    split: &ForfeitureSplit,
    legs: &mut Vec<DistributionLeg>,
) -> Result<(), DistributionError> {
    let creation_fee = total_creation_fee(escrow, stakes)?;
    let amounts =
        pledge_math::forfeit_distribution(&escrow.total_principal, accrued, &creation_fee, split)?;

    let (mut charity, mut platform, winner_legs) =
        route_winners_pool(escrow, plan, &amounts)?;

    if charity.is_positive() {
        let destination = charity_account(charity_id, escrow);
        // A platform-routed charity share merges into the platform leg.
        if destination.0 == AccountId::platform_revenue() {
            platform = platform.add(&charity)?;
            charity = Money::zero(escrow.currency.clone());
        }
        if charity.is_positive() {
            legs.push(transfer_leg(
                escrow,
                LegPurpose::Charity,
                None,
                format!("forfeiture charity share for goal {}", escrow.goal_id),
                escrow_account(escrow),
                destination,
                charity,
            ));
        }
    }

    if platform.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::Platform,
            None,
            format!("forfeiture platform share for goal {}", escrow.goal_id),
            escrow_account(escrow),
            platform_account(),
            platform,
        ));
    }

    legs.extend(winner_legs);

    if creation_fee.is_positive() {
        legs.push(transfer_leg(
            escrow,
            LegPurpose::CreationFee,
            None,
            format!("stake creation fee for goal {}", escrow.goal_id),
            escrow_account(escrow),
            platform_account(),
            creation_fee,
        ));
    }
    Ok(())
}

/// Split the winners pool pro-rata to the plan's shares. When no winner
/// is entitled to anything (no winners named, or every share is zero)
/// the pool goes to charity and platform in the base 30:20 proportion
/// instead of stranding it.
fn route_winners_pool(
    escrow: &Escrow,
    plan: &DistributionPlan,
    amounts: &ForfeitAmounts,
) -> Result<(Money, Money, Vec<DistributionLeg>), DistributionError> {
    // The split math hands rounding drift to the platform share, which
    // can leave it negative; claw that back from the larger shares
    // before any leg is cut.
    let mut base = [amounts.charity.clone(), amounts.winners_pool.clone()];
    let mut platform = absorb_drift(&mut base, amounts.app.clone())?;
    let [mut charity, pool] = base;
    let mut winner_legs = Vec::new();

    if !pool.is_positive() {
        return Ok((charity, platform, winner_legs));
    }

    let total_percent: Decimal = plan.winners.iter().map(|w| w.share_percent).sum();
    if total_percent <= Decimal::ZERO {
        if !plan.winners.is_empty() {
            warn!(
                goal = %escrow.goal_id,
                "winner shares sum to zero; routing pool as if no winners were named"
            );
        }
        let (shares, remainder) = pool.allocate(&[Decimal::new(6, 1)]); // 30:20 => 0.6
        charity = charity.add(&shares[0])?;
        platform = platform.add(&remainder)?;
        return Ok((charity, platform, winner_legs));
    }

    let weights: Vec<Decimal> = plan
        .winners
        .iter()
        .map(|w| w.share_percent / total_percent)
        .collect();
    let (mut shares, remainder) = pool.allocate(&weights);
    let remainder = absorb_drift(&mut shares, remainder)?;
    for (winner, share) in plan.winners.iter().zip(shares.iter()) {
        if share.is_positive() {
            winner_legs.push(transfer_leg(
                escrow,
                LegPurpose::WinnerShare,
                Some(&winner.user_id.0),
                format!("forfeiture redistribution for goal {}", escrow.goal_id),
                escrow_account(escrow),
                wallet_account(&winner.user_id),
                share.clone(),
            ));
        }
    }
    platform = platform.add(&remainder)?;
    Ok((charity, platform, winner_legs))
}

/// Employer match: corporate account to the stakeholder's wallet,
/// outside the escrow pot.
fn matching_leg(
    escrow: &Escrow,
    policy: &MatchingPolicy,
    outcome: GoalOutcome,
) -> Result<Option<DistributionLeg>, DistributionError> {
    let matched = pledge_math::matching_amount(policy, &escrow.total_principal, outcome)?;
    let Some(amount) = matched else {
        return Ok(None);
    };
    let amount = amount.round_cents();
    if !amount.is_positive() {
        return Ok(None);
    }
    let stakeholder = &escrow.stakeholders[0];
    Ok(Some(transfer_leg(
        escrow,
        LegPurpose::CorporateMatch,
        Some(&stakeholder.user_id.0),
        format!("employer match for goal {}", escrow.goal_id),
        (
            AccountId::corporate(&policy.corporate_account),
            AccountType::Liability,
        ),
        wallet_account(&stakeholder.user_id),
        amount,
    )))
}

/// Legs returning every stakeholder's principal; only valid before any
/// accrual.
pub fn refund_legs(escrow: &Escrow) -> Vec<DistributionLeg> {
    escrow
        .stakeholders
        .iter()
        .map(|stakeholder| {
            transfer_leg(
                escrow,
                LegPurpose::Refund,
                Some(&stakeholder.user_id.0),
                format!("refund for goal {}", escrow.goal_id),
                escrow_account(escrow),
                wallet_account(&stakeholder.user_id),
                stakeholder.principal.clone(),
            )
        })
        .collect()
}
