//! Process-local store mirroring `PgStore` semantics, used by the service tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::billing::{Entitlement, Feature, FulfillmentMarker, PaymentLog, PlanActivation};
use crate::models::referral::{Conversion, ReferralRecord, ReferralStatus};
use crate::models::user::{ReferralLink, ReferralRewards, UserRecord};
use crate::store::{AggregateUpdate, AggregateWrite, BillingStore, ConversionWrite, ReferralStore};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, UserRecord>,
    referrals: HashMap<Uuid, ReferralRecord>,
    /// (referrer, referee) → referral id
    pairs: HashMap<(Uuid, Uuid), Uuid>,
    markers: HashMap<String, FulfillmentMarker>,
    payment_logs: Vec<PaymentLog>,
    entitlements: HashMap<(Uuid, Feature), Entitlement>,
    /// Number of upcoming `write_referral_link` calls to silently drop.
    dropped_link_writes: usize,
    link_writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

fn user_not_found(user_id: Uuid) -> AppError {
    AppError::NotFound(format!("User {user_id} not found"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Seeds a referral as-is, bypassing the pair check.
    pub async fn seed_referral(&self, record: ReferralRecord) {
        let mut state = self.state.lock().await;
        if let Some(referee) = record.referee_id {
            state.pairs.insert((record.referrer_id, referee), record.id);
        }
        state.referrals.insert(record.id, record);
    }

    pub async fn user(&self, user_id: Uuid) -> Option<UserRecord> {
        self.state.lock().await.users.get(&user_id).cloned()
    }

    pub async fn referral(&self, referral_id: Uuid) -> Option<ReferralRecord> {
        self.state.lock().await.referrals.get(&referral_id).cloned()
    }

    pub async fn referral_count(&self) -> usize {
        self.state.lock().await.referrals.len()
    }

    pub async fn payment_logs(&self) -> Vec<PaymentLog> {
        self.state.lock().await.payment_logs.clone()
    }

    pub async fn entitlement(&self, user_id: Uuid, feature: Feature) -> Option<Entitlement> {
        self.state
            .lock()
            .await
            .entitlements
            .get(&(user_id, feature))
            .cloned()
    }

    /// Simulates lost writes: the next `n` link writes report success but store nothing.
    pub async fn drop_next_link_writes(&self, n: usize) {
        self.state.lock().await.dropped_link_writes = n;
    }

    pub async fn link_write_attempts(&self) -> usize {
        self.state.lock().await.link_writes
    }
}

#[async_trait]
impl ReferralStore for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, AppError> {
        Ok(self.user(user_id).await)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError> {
        let email = email.trim().to_lowercase();
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<UserRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.referral_code.as_deref() == Some(code))
            .cloned())
    }

    async fn assign_referral_code(&self, user_id: Uuid, code: &str) -> Result<String, AppError> {
        let mut state = self.state.lock().await;
        let taken = state
            .users
            .values()
            .any(|u| u.id != user_id && u.referral_code.as_deref() == Some(code));
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        if let Some(existing) = &user.referral_code {
            return Ok(existing.clone());
        }
        if taken {
            return Err(AppError::Conflict(format!("Referral code {code} is already taken")));
        }
        user.referral_code = Some(code.to_string());
        Ok(code.to_string())
    }

    async fn write_referral_link(
        &self,
        user_id: Uuid,
        link: &ReferralLink,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.link_writes += 1;
        if !state.users.contains_key(&user_id) {
            return Err(user_not_found(user_id));
        }
        if state.dropped_link_writes > 0 {
            state.dropped_link_writes -= 1;
            return Ok(());
        }
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.referred_by = Some(link.referred_by);
        user.referred_by_code = Some(link.referred_by_code.clone());
        user.referral_discount = link.discount_percent;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_referred_by(&self, user_id: Uuid, referrer_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.referred_by = Some(referrer_id);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn find_referral(
        &self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> Result<Option<ReferralRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .pairs
            .get(&(referrer_id, referee_id))
            .and_then(|id| state.referrals.get(id))
            .cloned())
    }

    async fn find_pending_invite(
        &self,
        referrer_id: Uuid,
        email: &str,
    ) -> Result<Option<ReferralRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .values()
            .filter(|r| {
                r.referrer_id == referrer_id
                    && r.status == ReferralStatus::Invited
                    && r.email.as_deref() == Some(email)
            })
            .min_by_key(|r| r.created_at)
            .cloned())
    }

    async fn list_referrals(&self, referrer_id: Uuid) -> Result<Vec<ReferralRecord>, AppError> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .referrals
            .values()
            .filter(|r| r.referrer_id == referrer_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn count_paid_referrals(&self, referrer_id: Uuid) -> Result<i64, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .values()
            .filter(|r| r.referrer_id == referrer_id && r.status == ReferralStatus::Paid)
            .count() as i64)
    }

    async fn insert_referral(&self, record: &ReferralRecord) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(referee) = record.referee_id {
            let key = (record.referrer_id, referee);
            if state.pairs.contains_key(&key) {
                return Err(AppError::Conflict(format!(
                    "Referral between {} and {referee} already exists",
                    record.referrer_id
                )));
            }
            state.pairs.insert(key, record.id);
        }
        state.referrals.insert(record.id, record.clone());
        Ok(())
    }

    async fn promote_invite(&self, referral_id: Uuid, referee_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.referrals.get(&referral_id) else {
            return Ok(false);
        };
        if record.status != ReferralStatus::Invited {
            return Ok(false);
        }
        let key = (record.referrer_id, referee_id);
        if state.pairs.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "Referee {referee_id} already has a referral from this referrer"
            )));
        }
        state.pairs.insert(key, referral_id);
        if let Some(record) = state.referrals.get_mut(&referral_id) {
            let now = Utc::now();
            record.referee_id = Some(referee_id);
            record.status = ReferralStatus::Registered;
            record.registered_at = Some(now);
            record.updated_at = now;
        }
        Ok(true)
    }

    async fn increment_total_referrals(&self, user_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.referral_stats.total_referrals += 1;
        Ok(())
    }

    async fn increment_registered_referrals(&self, user_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.referral_stats.registered_referrals += 1;
        Ok(())
    }

    async fn apply_conversion(
        &self,
        referral_id: Uuid,
        referrer_id: Uuid,
        conversion: &Conversion,
        update: AggregateUpdate<'_>,
    ) -> Result<ConversionWrite, AppError> {
        let mut state = self.state.lock().await;
        let status = state
            .referrals
            .get(&referral_id)
            .map(|r| r.status)
            .ok_or_else(|| AppError::NotFound(format!("Referral {referral_id} not found")))?;
        if !status.can_advance_to(ReferralStatus::Paid) {
            return Ok(ConversionWrite::AlreadyPaid);
        }

        // Check the referrer first so a fault leaves the referral untouched.
        let referrer = state.users.get_mut(&referrer_id).ok_or_else(|| {
            AppError::Integrity(format!(
                "Referrer {referrer_id} has no user record for referral {referral_id}"
            ))
        })?;
        let earnings_delta = update(&mut referrer.referral_stats, &mut referrer.referral_rewards);
        let write = AggregateWrite {
            stats: referrer.referral_stats.clone(),
            rewards: referrer.referral_rewards.clone(),
            earnings_delta,
        };

        if let Some(record) = state.referrals.get_mut(&referral_id) {
            record.status = ReferralStatus::Paid;
            record.converted_at = Some(conversion.converted_at);
            record.updated_at = conversion.converted_at;
            record.plan_purchased = Some(conversion.plan_purchased.clone());
            record.payment_amount = Some(conversion.payment_amount);
        }
        Ok(ConversionWrite::Applied(write))
    }

    async fn update_aggregate(
        &self,
        user_id: Uuid,
        update: AggregateUpdate<'_>,
    ) -> Result<AggregateWrite, AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        let earnings_delta = update(&mut user.referral_stats, &mut user.referral_rewards);
        Ok(AggregateWrite {
            stats: user.referral_stats.clone(),
            rewards: user.referral_rewards.clone(),
            earnings_delta,
        })
    }

    async fn redeem_credits(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> Result<Option<ReferralRewards>, AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        let rewards = &mut user.referral_rewards;
        if rewards.available_credits < amount {
            return Ok(None);
        }
        rewards.available_credits -= amount;
        rewards.redeemed_credits += amount;
        Ok(Some(rewards.clone()))
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_fulfillment(
        &self,
        session_id: &str,
    ) -> Result<Option<FulfillmentMarker>, AppError> {
        Ok(self.state.lock().await.markers.get(session_id).cloned())
    }

    async fn mark_fulfilled(&self, marker: &FulfillmentMarker) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if state
            .markers
            .get(&marker.session_id)
            .is_some_and(|m| m.fulfilled)
        {
            return Ok(false);
        }
        let mut stored = marker.clone();
        stored.fulfilled = true;
        stored.fulfilled_at = Some(marker.fulfilled_at.unwrap_or_else(Utc::now));
        state.markers.insert(stored.session_id.clone(), stored);
        Ok(true)
    }

    async fn activate_plan(
        &self,
        user_id: Uuid,
        activation: &PlanActivation,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        if let Some(currency) = &activation.currency {
            user.currency = Some(currency.clone());
        }
        user.profile_slots += activation.extra_profile_slots;
        if let Some(grant) = &activation.plan {
            user.plan = Some(grant.plan.clone());
            user.plan_expires_at = Some(grant.expires_at);
        }
        for entitlement in &activation.entitlements {
            state
                .entitlements
                .insert((user_id, entitlement.feature), entitlement.clone());
        }
        Ok(())
    }

    async fn append_payment_log(&self, log: &PaymentLog) -> Result<(), AppError> {
        self.state.lock().await.payment_logs.push(log.clone());
        Ok(())
    }
}
