//! Referrer dashboard reads, credit redemption and earnings recalculation.

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::referral::ReferralRecord;
use crate::models::user::{ReferralRewards, ReferralStats};
use crate::referrals::earnings::settle;
use crate::store::{AggregateWrite, ReferralStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralSummary {
    pub referral_code: Option<String>,
    pub referral_stats: ReferralStats,
    pub referral_rewards: ReferralRewards,
    pub referrals: Vec<ReferralRecord>,
}

pub async fn referral_summary(
    store: &dyn ReferralStore,
    user_id: Uuid,
) -> Result<ReferralSummary, AppError> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))?;
    let referrals = store.list_referrals(user_id).await?;

    Ok(ReferralSummary {
        referral_code: user.referral_code,
        referral_stats: user.referral_stats,
        referral_rewards: user.referral_rewards,
        referrals,
    })
}

pub async fn redeem(
    store: &dyn ReferralStore,
    user_id: Uuid,
    amount: i64,
) -> Result<ReferralRewards, AppError> {
    if amount <= 0 {
        return Err(AppError::Validation(
            "amount must be greater than zero".to_string(),
        ));
    }

    let rewards = store
        .redeem_credits(user_id, amount)
        .await?
        .ok_or_else(|| AppError::Validation("Insufficient credits".to_string()))?;

    info!(%user_id, amount, available = rewards.available_credits, "Referral credits redeemed");
    Ok(rewards)
}

/// Re-derives `paid_referrals` from the referral records and settles earnings and
/// credits against it.
pub async fn recalculate(
    store: &dyn ReferralStore,
    user_id: Uuid,
) -> Result<AggregateWrite, AppError> {
    let paid = store.count_paid_referrals(user_id).await?;
    let settle_to = move |stats: &mut ReferralStats, rewards: &mut ReferralRewards| {
        settle(stats, rewards, paid)
    };
    let write = store.update_aggregate(user_id, &settle_to).await?;

    info!(
        %user_id,
        paid_referrals = write.stats.paid_referrals,
        total_earnings = write.stats.total_earnings,
        delta = write.earnings_delta,
        "Referral earnings recalculated"
    );
    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::referral::ReferralStatus;
    use crate::referrals::fixtures::{referrer, store_with, user};

    #[tokio::test]
    async fn test_redeem_bounds() {
        let mut owner = referrer("ref@example.com", "CODE0001");
        owner.referral_rewards.available_credits = 100;
        let store = store_with(&[&owner]).await;

        assert!(matches!(
            redeem(&store, owner.id, 0).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            redeem(&store, owner.id, 101).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let rewards = redeem(&store, owner.id, 60).await.unwrap();
        assert_eq!(rewards.available_credits, 40);
        assert_eq!(rewards.redeemed_credits, 60);
    }

    #[tokio::test]
    async fn test_recalculate_settles_from_records() {
        let mut owner = referrer("ref@example.com", "CODE0001");
        // Aggregate drifted: one paid conversion was never counted.
        owner.referral_stats.paid_referrals = 2;
        owner.referral_rewards.available_credits = 10;
        let store = store_with(&[&owner]).await;
        for i in 0..3 {
            let friend = user(&format!("friend{i}@example.com"));
            store.insert_user(friend.clone()).await;
            let mut record =
                ReferralRecord::registered(owner.id, friend.id, "CODE0001", "Pal", Some(&friend.email));
            record.status = ReferralStatus::Paid;
            store.seed_referral(record).await;
        }

        let write = recalculate(&store, owner.id).await.unwrap();
        assert_eq!(write.stats.paid_referrals, 3);
        assert_eq!(write.stats.total_earnings, 100);
        assert_eq!(write.earnings_delta, 100);
        assert_eq!(write.rewards.available_credits, 110);

        let again = recalculate(&store, owner.id).await.unwrap();
        assert_eq!(again.earnings_delta, 0);
        assert_eq!(again.rewards.available_credits, 110);
    }

    #[tokio::test]
    async fn test_summary_lists_referrals() {
        let owner = referrer("ref@example.com", "CODE0001");
        let store = store_with(&[&owner]).await;
        store
            .seed_referral(ReferralRecord::invited(owner.id, "CODE0001", "Pal", Some("p@x.com"), None))
            .await;

        let summary = referral_summary(&store, owner.id).await.unwrap();
        assert_eq!(summary.referral_code.as_deref(), Some("CODE0001"));
        assert_eq!(summary.referrals.len(), 1);

        let err = referral_summary(&store, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
