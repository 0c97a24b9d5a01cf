//! Persistence seam for the referral ledger and payment fulfillment.
//!
//! Handlers and services only ever see `Arc<dyn ReferralStore>` / `Arc<dyn BillingStore>`
//! from `AppState`. `PgStore` is the production backend; `MemoryStore` backs the tests.
//!
//! Every multi-field mutation that must not interleave with a concurrent writer
//! (`apply_conversion`, `update_aggregate`, `redeem_credits`) is atomic inside the store.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::billing::{FulfillmentMarker, PaymentLog, PlanActivation};
use crate::models::referral::{Conversion, ReferralRecord};
use crate::models::user::{ReferralLink, ReferralRewards, ReferralStats, UserRecord};

#[cfg(test)]
pub mod memory;
pub mod postgres;

/// Mutates a referrer aggregate in place and returns the credit delta it produced.
pub type AggregateUpdate<'a> =
    &'a (dyn Fn(&mut ReferralStats, &mut ReferralRewards) -> i64 + Send + Sync);

/// The aggregate after an atomic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateWrite {
    pub stats: ReferralStats,
    pub rewards: ReferralRewards,
    pub earnings_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionWrite {
    /// The referral was already `paid`; nothing was written.
    AlreadyPaid,
    Applied(AggregateWrite),
}

#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, AppError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError>;

    /// `code` must already be normalized (upper-case).
    async fn find_user_by_referral_code(&self, code: &str)
        -> Result<Option<UserRecord>, AppError>;

    /// Stores `code` as the user's own code unless one is already set.
    /// Returns the code the user ends up with.
    async fn assign_referral_code(&self, user_id: Uuid, code: &str) -> Result<String, AppError>;

    async fn write_referral_link(&self, user_id: Uuid, link: &ReferralLink)
        -> Result<(), AppError>;

    async fn set_referred_by(&self, user_id: Uuid, referrer_id: Uuid) -> Result<(), AppError>;

    async fn find_referral(
        &self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> Result<Option<ReferralRecord>, AppError>;

    /// An `invited` record for this referrer addressed to `email` (lower-case).
    async fn find_pending_invite(
        &self,
        referrer_id: Uuid,
        email: &str,
    ) -> Result<Option<ReferralRecord>, AppError>;

    async fn list_referrals(&self, referrer_id: Uuid) -> Result<Vec<ReferralRecord>, AppError>;

    async fn count_paid_referrals(&self, referrer_id: Uuid) -> Result<i64, AppError>;

    /// Fails with `AppError::Conflict` if a record for the same (referrer, referee) exists.
    async fn insert_referral(&self, record: &ReferralRecord) -> Result<(), AppError>;

    /// Moves an `invited` record to `registered` for `referee_id`.
    /// Returns false if the record was no longer `invited`.
    async fn promote_invite(&self, referral_id: Uuid, referee_id: Uuid)
        -> Result<bool, AppError>;

    async fn increment_total_referrals(&self, user_id: Uuid) -> Result<(), AppError>;

    async fn increment_registered_referrals(&self, user_id: Uuid) -> Result<(), AppError>;

    /// Atomically marks the referral `paid` (only if it is not already) and applies
    /// `update` to the referrer's aggregate. A missing referrer aborts the whole write
    /// with `AppError::Integrity`.
    async fn apply_conversion(
        &self,
        referral_id: Uuid,
        referrer_id: Uuid,
        conversion: &Conversion,
        update: AggregateUpdate<'_>,
    ) -> Result<ConversionWrite, AppError>;

    /// Atomically applies `update` to a user's aggregate.
    async fn update_aggregate(
        &self,
        user_id: Uuid,
        update: AggregateUpdate<'_>,
    ) -> Result<AggregateWrite, AppError>;

    /// Moves `amount` from available to redeemed credits.
    /// Returns `None` if the balance is insufficient.
    async fn redeem_credits(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> Result<Option<ReferralRewards>, AppError>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_fulfillment(&self, session_id: &str)
        -> Result<Option<FulfillmentMarker>, AppError>;

    /// Records the marker as fulfilled. Returns false if it already was.
    async fn mark_fulfilled(&self, marker: &FulfillmentMarker) -> Result<bool, AppError>;

    async fn activate_plan(&self, user_id: Uuid, activation: &PlanActivation)
        -> Result<(), AppError>;

    async fn append_payment_log(&self, log: &PaymentLog) -> Result<(), AppError>;
}
