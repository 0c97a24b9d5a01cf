//! Signup tracking: links a new user to the referrer whose code they used.

use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::referral::ReferralRecord;
use crate::models::user::{ReferralLink, UserRecord};
use crate::referrals::codes::normalize_code;
use crate::store::ReferralStore;

/// Discount granted to referred users on their first purchase.
pub const REFERRAL_DISCOUNT_PERCENT: i32 = 15;
/// Pause before the single re-write of a link that did not persist.
pub const LINK_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignupOutcome {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub discount: i32,
    /// False when the pair was already tracked and nothing was counted again.
    pub newly_registered: bool,
}

pub async fn track_signup(
    store: &dyn ReferralStore,
    referee_id: Uuid,
    referral_code: &str,
    email: Option<&str>,
) -> Result<SignupOutcome, AppError> {
    let code = normalize_code(referral_code);
    if code.is_empty() {
        return Err(AppError::Validation(
            "referralCode cannot be empty".to_string(),
        ));
    }

    let referee = store
        .get_user(referee_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {referee_id} not found")))?;

    let referrer = store
        .find_user_by_referral_code(&code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Invalid referral code: {code}")))?;

    if referrer.id == referee.id {
        return Err(AppError::Validation(
            "Users cannot use their own referral code".to_string(),
        ));
    }

    // A referee belongs to one referrer for life; a later code never re-attributes them.
    if let Some(existing) = referee.referred_by.filter(|id| *id != referrer.id) {
        warn!(%referee_id, referred_by = %existing, "Signup with a second referrer's code rejected");
        return Err(AppError::Conflict(format!(
            "User {referee_id} was already referred by another user"
        )));
    }

    let email = email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| referee.email.clone());

    let (referral_id, newly_registered) =
        match store.find_referral(referrer.id, referee.id).await? {
            Some(existing) => {
                info!(referral_id = %existing.id, "Signup already tracked for this pair");
                (existing.id, false)
            }
            None => register(store, &referrer, &referee, &code, &email).await?,
        };

    if newly_registered {
        store.increment_registered_referrals(referrer.id).await?;
    }

    let link = ReferralLink {
        referred_by: referrer.id,
        referred_by_code: code,
        discount_percent: REFERRAL_DISCOUNT_PERCENT,
    };
    store.write_referral_link(referee.id, &link).await?;
    verify_link(store, referee.id, &link).await?;

    info!(
        %referee_id,
        referrer_id = %referrer.id,
        %referral_id,
        "Referral signup tracked"
    );

    Ok(SignupOutcome {
        referral_id,
        referrer_id: referrer.id,
        discount: REFERRAL_DISCOUNT_PERCENT,
        newly_registered,
    })
}

/// Promotes a pending invite for this email, or creates a `registered` record for a
/// direct-link signup. Returns `(id, newly_registered)`.
async fn register(
    store: &dyn ReferralStore,
    referrer: &UserRecord,
    referee: &UserRecord,
    code: &str,
    email: &str,
) -> Result<(Uuid, bool), AppError> {
    if let Some(invite) = store.find_pending_invite(referrer.id, email).await? {
        if store.promote_invite(invite.id, referee.id).await? {
            info!(referral_id = %invite.id, "Promoted invite to registered");
            return Ok((invite.id, true));
        }
    }

    let record = ReferralRecord::registered(referrer.id, referee.id, code, "Direct Signup", Some(email));
    match store.insert_referral(&record).await {
        Ok(()) => Ok((record.id, true)),
        // A concurrent signup for the same pair won; reuse its record.
        Err(AppError::Conflict(_)) => {
            let existing = store
                .find_referral(referrer.id, referee.id)
                .await?
                .ok_or_else(|| {
                    AppError::Integrity(format!(
                        "Referral pair {}/{} conflicted but cannot be read",
                        referrer.id, referee.id
                    ))
                })?;
            Ok((existing.id, false))
        }
        Err(e) => Err(e),
    }
}

/// Re-reads the referee and rewrites the link once if `referred_by` did not stick.
async fn verify_link(
    store: &dyn ReferralStore,
    referee_id: Uuid,
    link: &ReferralLink,
) -> Result<(), AppError> {
    if persisted_referrer(store, referee_id).await? == Some(link.referred_by) {
        return Ok(());
    }

    warn!(%referee_id, "referredBy missing right after write; retrying once");
    tokio::time::sleep(LINK_RETRY_DELAY).await;
    store.write_referral_link(referee_id, link).await?;

    if persisted_referrer(store, referee_id).await? != Some(link.referred_by) {
        warn!(%referee_id, "referredBy still missing after retry; conversion will backfill from code");
    }
    Ok(())
}

async fn persisted_referrer(
    store: &dyn ReferralStore,
    user_id: Uuid,
) -> Result<Option<Uuid>, AppError> {
    Ok(store.get_user(user_id).await?.and_then(|u| u.referred_by))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::referral::ReferralStatus;
    use crate::notify::testing::RecordingNotifier;
    use crate::referrals::conversion::{record_conversion, ConversionOutcome};
    use crate::referrals::fixtures::{referrer, store_with, user};

    #[tokio::test]
    async fn test_direct_signup_creates_registered_record() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("new@example.com");
        let store = store_with(&[&referrer, &referee]).await;

        let outcome = track_signup(&store, referee.id, " code0001 ", Some("New@Example.com"))
            .await
            .unwrap();

        assert!(outcome.newly_registered);
        assert_eq!(outcome.discount, 15);
        let record = store.referral(outcome.referral_id).await.unwrap();
        assert_eq!(record.status, ReferralStatus::Registered);
        assert_eq!(record.referee_id, Some(referee.id));
        assert_eq!(record.referral_code, "CODE0001");

        let linked = store.user(referee.id).await.unwrap();
        assert_eq!(linked.referred_by, Some(referrer.id));
        assert_eq!(linked.referred_by_code.as_deref(), Some("CODE0001"));
        assert_eq!(linked.referral_discount, 15);

        let stats = store.user(referrer.id).await.unwrap().referral_stats;
        assert_eq!(stats.registered_referrals, 1);
        assert_eq!(stats.paid_referrals, 0);
        assert_eq!(stats.total_earnings, 0);
    }

    #[tokio::test]
    async fn test_signup_promotes_matching_invite() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("friend@example.com");
        let store = store_with(&[&referrer, &referee]).await;
        let invite = ReferralRecord::invited(referrer.id, "CODE0001", "Pal", Some("friend@example.com"), None);
        let invite_id = invite.id;
        store.seed_referral(invite).await;

        let outcome = track_signup(&store, referee.id, "CODE0001", Some("friend@example.com"))
            .await
            .unwrap();

        assert_eq!(outcome.referral_id, invite_id);
        assert_eq!(store.referral_count().await, 1);
        let record = store.referral(invite_id).await.unwrap();
        assert_eq!(record.status, ReferralStatus::Registered);
        assert_eq!(record.friend_name, "Pal");
        assert!(record.registered_at.is_some());
    }

    #[tokio::test]
    async fn test_repeated_signup_is_idempotent() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("new@example.com");
        let store = store_with(&[&referrer, &referee]).await;

        let first = track_signup(&store, referee.id, "CODE0001", None).await.unwrap();
        let second = track_signup(&store, referee.id, "CODE0001", None).await.unwrap();

        assert_eq!(first.referral_id, second.referral_id);
        assert!(!second.newly_registered);
        assert_eq!(store.referral_count().await, 1);
        assert_eq!(
            store.user(referrer.id).await.unwrap().referral_stats.registered_referrals,
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_code_and_self_referral_rejected() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let store = store_with(&[&referrer]).await;

        let err = track_signup(&store, referrer.id, "NOPE", None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = track_signup(&store, referrer.id, "CODE0001", None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = track_signup(&store, Uuid::new_v4(), "CODE0001", None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_referee_cannot_be_relinked_to_second_referrer() {
        let first = referrer("a@example.com", "CODEAAAA");
        let second = referrer("b@example.com", "CODEBBBB");
        let referee = user("x@example.com");
        let store = store_with(&[&first, &second, &referee]).await;
        let notifier = RecordingNotifier::default();

        track_signup(&store, referee.id, "CODEAAAA", None).await.unwrap();
        record_conversion(&store, &notifier, referee.id, "monthly", 499)
            .await
            .unwrap();

        let err = track_signup(&store, referee.id, "CODEBBBB", None).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let again = record_conversion(&store, &notifier, referee.id, "monthly", 499)
            .await
            .unwrap();
        assert!(matches!(again, ConversionOutcome::AlreadyConverted { .. }));

        let linked = store.user(referee.id).await.unwrap();
        assert_eq!(linked.referred_by, Some(first.id));
        assert_eq!(linked.referred_by_code.as_deref(), Some("CODEAAAA"));
        assert_eq!(store.referral_count().await, 1);
        let first_stats = store.user(first.id).await.unwrap().referral_stats;
        let second_stats = store.user(second.id).await.unwrap().referral_stats;
        assert_eq!(first_stats.paid_referrals, 1);
        assert_eq!(second_stats.paid_referrals, 0);
        assert_eq!(second_stats.registered_referrals, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_write_is_retried_once() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("new@example.com");
        let store = store_with(&[&referrer, &referee]).await;
        store.drop_next_link_writes(1).await;

        track_signup(&store, referee.id, "CODE0001", None).await.unwrap();

        assert_eq!(store.link_write_attempts().await, 2);
        assert_eq!(
            store.user(referee.id).await.unwrap().referred_by,
            Some(referrer.id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_retry_is_bounded() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("new@example.com");
        let store = store_with(&[&referrer, &referee]).await;
        store.drop_next_link_writes(5).await;

        let outcome = track_signup(&store, referee.id, "CODE0001", None).await.unwrap();

        assert!(outcome.newly_registered);
        assert_eq!(store.link_write_attempts().await, 2, "exactly one retry");
        assert_eq!(store.user(referee.id).await.unwrap().referred_by, None);
    }

    #[tokio::test]
    async fn test_healthy_write_is_not_retried() {
        let referrer = referrer("ref@example.com", "CODE0001");
        let referee = user("new@example.com");
        let store = store_with(&[&referrer, &referee]).await;

        track_signup(&store, referee.id, "CODE0001", None).await.unwrap();

        assert_eq!(store.link_write_attempts().await, 1);
    }
}
