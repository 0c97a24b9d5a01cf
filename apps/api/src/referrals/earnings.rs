//! Milestone earnings rule.
//!
//! Rewards vest in batches: every complete set of `MILESTONE_SIZE` paid referrals
//! is worth `MILESTONE_REWARD`. 3 paid → 100, 6 → 200, 10 → 300 (not 333).
//! This is the only place the rule lives; conversion, repair and recalculation all
//! go through it.

use crate::models::user::{ReferralRewards, ReferralStats};

pub const MILESTONE_SIZE: i64 = 3;
pub const MILESTONE_REWARD: i64 = 100;

/// Total earnings owed for a given number of paid referrals.
pub fn milestone_earnings(paid_referrals: i64) -> i64 {
    (paid_referrals.max(0) / MILESTONE_SIZE) * MILESTONE_REWARD
}

/// Records one more paid referral. Credits move by the earnings delta only.
/// Returns the delta.
pub fn accrue_paid_referral(stats: &mut ReferralStats, rewards: &mut ReferralRewards) -> i64 {
    let paid_referrals = stats.paid_referrals + 1;
    settle(stats, rewards, paid_referrals)
}

/// Re-derives earnings from an authoritative paid count (repair path).
/// Credits never drop below zero even if earnings shrink.
pub fn settle(stats: &mut ReferralStats, rewards: &mut ReferralRewards, paid_referrals: i64) -> i64 {
    let total_earnings = milestone_earnings(paid_referrals);
    let delta = total_earnings - stats.total_earnings;

    stats.paid_referrals = paid_referrals;
    stats.total_earnings = total_earnings;
    rewards.available_credits = (rewards.available_credits + delta).max(0);
    delta
}
