use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::billing::{FulfillmentMarker, PaymentLog, PlanActivation};
use crate::models::referral::{Conversion, ReferralRecord, ReferralStatus};
use crate::models::user::{ReferralLink, ReferralRewards, ReferralStats, UserRecord};
use crate::store::{AggregateUpdate, AggregateWrite, BillingStore, ConversionWrite, ReferralStore};

/// Postgres-backed store. Uniqueness of (referrer, referee) is a table constraint;
/// aggregate updates lock the user row for the length of their transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct AggregateRow {
    #[sqlx(flatten)]
    stats: ReferralStats,
    #[sqlx(flatten)]
    rewards: ReferralRewards,
}

fn conflict_or_db(err: sqlx::Error, message: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(message()),
        _ => AppError::Database(err),
    }
}

fn user_not_found(user_id: Uuid) -> AppError {
    AppError::NotFound(format!("User {user_id} not found"))
}

/// Locks the user row and applies `update`. `None` if the user does not exist.
async fn update_aggregate_in(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    update: AggregateUpdate<'_>,
) -> Result<Option<AggregateWrite>, AppError> {
    let row: Option<AggregateRow> = sqlx::query_as(
        r#"
        SELECT total_referrals, registered_referrals, paid_referrals, total_earnings,
               available_credits, redeemed_credits
        FROM users
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(AggregateRow {
        mut stats,
        mut rewards,
    }) = row
    else {
        return Ok(None);
    };

    let earnings_delta = update(&mut stats, &mut rewards);

    sqlx::query(
        r#"
        UPDATE users
        SET total_referrals = $2,
            registered_referrals = $3,
            paid_referrals = $4,
            total_earnings = $5,
            available_credits = $6,
            redeemed_credits = $7,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(stats.total_referrals)
    .bind(stats.registered_referrals)
    .bind(stats.paid_referrals)
    .bind(stats.total_earnings)
    .bind(rewards.available_credits)
    .bind(rewards.redeemed_credits)
    .execute(&mut **tx)
    .await?;

    Ok(Some(AggregateWrite {
        stats,
        rewards,
        earnings_delta,
    }))
}

#[async_trait]
impl ReferralStore for PgStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE email = $1 LIMIT 1")
                .bind(email.trim().to_lowercase())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<UserRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE referral_code = $1 LIMIT 1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn assign_referral_code(&self, user_id: Uuid, code: &str) -> Result<String, AppError> {
        let assigned: Option<Option<String>> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET referral_code = COALESCE(referral_code, $2), updated_at = now()
            WHERE id = $1
            RETURNING referral_code
            "#,
        )
        .bind(user_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, || format!("Referral code {code} is already taken")))?;

        assigned
            .flatten()
            .ok_or_else(|| user_not_found(user_id))
    }

    async fn write_referral_link(
        &self,
        user_id: Uuid,
        link: &ReferralLink,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET referred_by = $2, referred_by_code = $3, referral_discount = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(link.referred_by)
        .bind(&link.referred_by_code)
        .bind(link.discount_percent)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn set_referred_by(&self, user_id: Uuid, referrer_id: Uuid) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE users SET referred_by = $2, updated_at = now() WHERE id = $1")
                .bind(user_id)
                .bind(referrer_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn find_referral(
        &self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> Result<Option<ReferralRecord>, AppError> {
        Ok(sqlx::query_as::<_, ReferralRecord>(
            "SELECT * FROM referrals WHERE referrer_id = $1 AND referee_id = $2",
        )
        .bind(referrer_id)
        .bind(referee_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_pending_invite(
        &self,
        referrer_id: Uuid,
        email: &str,
    ) -> Result<Option<ReferralRecord>, AppError> {
        Ok(sqlx::query_as::<_, ReferralRecord>(
            r#"
            SELECT * FROM referrals
            WHERE referrer_id = $1 AND email = $2 AND status = 'invited'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(referrer_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_referrals(&self, referrer_id: Uuid) -> Result<Vec<ReferralRecord>, AppError> {
        Ok(sqlx::query_as::<_, ReferralRecord>(
            "SELECT * FROM referrals WHERE referrer_id = $1 ORDER BY created_at DESC",
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_paid_referrals(&self, referrer_id: Uuid) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM referrals WHERE referrer_id = $1 AND status = 'paid'",
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn insert_referral(&self, record: &ReferralRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO referrals
                (id, referrer_id, referee_id, referral_code, friend_name, email, phone, status,
                 created_at, updated_at, registered_at, converted_at, plan_purchased, payment_amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(record.referrer_id)
        .bind(record.referee_id)
        .bind(&record.referral_code)
        .bind(&record.friend_name)
        .bind(&record.email)
        .bind(&record.phone)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.registered_at)
        .bind(record.converted_at)
        .bind(&record.plan_purchased)
        .bind(record.payment_amount)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_db(e, || {
                format!(
                    "Referral between {} and {:?} already exists",
                    record.referrer_id, record.referee_id
                )
            })
        })?;

        debug!(referral_id = %record.id, status = record.status.as_str(), "Inserted referral");
        Ok(())
    }

    async fn promote_invite(&self, referral_id: Uuid, referee_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE referrals
            SET referee_id = $2, status = 'registered', registered_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'invited'
            "#,
        )
        .bind(referral_id)
        .bind(referee_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_db(e, || {
                format!("Referee {referee_id} already has a referral from this referrer")
            })
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_total_referrals(&self, user_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE users SET total_referrals = total_referrals + 1, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn increment_registered_referrals(&self, user_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET registered_referrals = registered_referrals + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn apply_conversion(
        &self,
        referral_id: Uuid,
        referrer_id: Uuid,
        conversion: &Conversion,
        update: AggregateUpdate<'_>,
    ) -> Result<ConversionWrite, AppError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM referrals WHERE id = $1 FOR UPDATE")
                .bind(referral_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = status
            .ok_or_else(|| AppError::NotFound(format!("Referral {referral_id} not found")))?;
        let status = ReferralStatus::try_from(status).map_err(|e| AppError::Internal(e.into()))?;
        if !status.can_advance_to(ReferralStatus::Paid) {
            tx.rollback().await?;
            return Ok(ConversionWrite::AlreadyPaid);
        }

        sqlx::query(
            r#"
            UPDATE referrals
            SET status = 'paid', converted_at = $2, updated_at = now(),
                plan_purchased = $3, payment_amount = $4
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(conversion.converted_at)
        .bind(&conversion.plan_purchased)
        .bind(conversion.payment_amount)
        .execute(&mut *tx)
        .await?;

        // Dropping the transaction on the error path rolls the status change back.
        let write = update_aggregate_in(&mut tx, referrer_id, update)
            .await?
            .ok_or_else(|| {
                AppError::Integrity(format!(
                    "Referrer {referrer_id} has no user record for referral {referral_id}"
                ))
            })?;

        tx.commit().await?;
        Ok(ConversionWrite::Applied(write))
    }

    async fn update_aggregate(
        &self,
        user_id: Uuid,
        update: AggregateUpdate<'_>,
    ) -> Result<AggregateWrite, AppError> {
        let mut tx = self.pool.begin().await?;
        let write = update_aggregate_in(&mut tx, user_id, update)
            .await?
            .ok_or_else(|| user_not_found(user_id))?;
        tx.commit().await?;
        Ok(write)
    }

    async fn redeem_credits(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> Result<Option<ReferralRewards>, AppError> {
        let rewards: Option<ReferralRewards> = sqlx::query_as(
            r#"
            UPDATE users
            SET available_credits = available_credits - $2,
                redeemed_credits = redeemed_credits + $2,
                updated_at = now()
            WHERE id = $1 AND available_credits >= $2
            RETURNING available_credits, redeemed_credits
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        if rewards.is_none() && self.get_user(user_id).await?.is_none() {
            return Err(user_not_found(user_id));
        }
        Ok(rewards)
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get_fulfillment(
        &self,
        session_id: &str,
    ) -> Result<Option<FulfillmentMarker>, AppError> {
        Ok(sqlx::query_as::<_, FulfillmentMarker>(
            "SELECT * FROM fulfillment_markers WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_fulfilled(&self, marker: &FulfillmentMarker) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO fulfillment_markers
                (session_id, user_id, plan, billing_cycle, amount, currency, fulfilled, fulfilled_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)
            ON CONFLICT (session_id) DO UPDATE
                SET fulfilled = TRUE, fulfilled_at = EXCLUDED.fulfilled_at
                WHERE fulfillment_markers.fulfilled = FALSE
            "#,
        )
        .bind(&marker.session_id)
        .bind(marker.user_id)
        .bind(&marker.plan)
        .bind(&marker.billing_cycle)
        .bind(marker.amount)
        .bind(&marker.currency)
        .bind(marker.fulfilled_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn activate_plan(
        &self,
        user_id: Uuid,
        activation: &PlanActivation,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE users
            SET currency = COALESCE($2, currency), profile_slots = profile_slots + $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(&activation.currency)
        .bind(activation.extra_profile_slots)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(user_id));
        }

        if let Some(grant) = &activation.plan {
            sqlx::query("UPDATE users SET plan = $2, plan_expires_at = $3 WHERE id = $1")
                .bind(user_id)
                .bind(&grant.plan)
                .bind(grant.expires_at)
                .execute(&mut *tx)
                .await?;
        }

        for entitlement in &activation.entitlements {
            sqlx::query(
                r#"
                INSERT INTO user_entitlements (user_id, feature, plan, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, feature) DO UPDATE
                    SET plan = EXCLUDED.plan, expires_at = EXCLUDED.expires_at, updated_at = now()
                "#,
            )
            .bind(user_id)
            .bind(entitlement.feature.as_str())
            .bind(&entitlement.plan)
            .bind(entitlement.expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_payment_log(&self, log: &PaymentLog) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO payment_logs
                (id, user_id, kind, session_id, plan, billing_cycle, amount, currency,
                 payment_id, coupon_code, discount, status, attribution, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(log.id)
        .bind(log.user_id)
        .bind(&log.kind)
        .bind(&log.session_id)
        .bind(&log.plan)
        .bind(&log.billing_cycle)
        .bind(log.amount)
        .bind(&log.currency)
        .bind(&log.payment_id)
        .bind(&log.coupon_code)
        .bind(log.discount)
        .bind(&log.status)
        .bind(&log.attribution)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
