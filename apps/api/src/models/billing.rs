use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Idempotency marker keyed by the payment provider's checkout session id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentMarker {
    pub session_id: String,
    pub user_id: Uuid,
    pub plan: Option<String>,
    pub billing_cycle: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub fulfilled: bool,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

/// Append-only audit row for a payment event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub kind: String,
    pub session_id: String,
    pub plan: Option<String>,
    pub billing_cycle: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub payment_id: Option<String>,
    pub coupon_code: Option<String>,
    pub discount: f64,
    pub status: String,
    /// utm-style acquisition fields carried through checkout metadata.
    pub attribution: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    JobTracker,
    InterviewKit,
    ApplyPro,
    InterviewPro,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::JobTracker => "job_tracker",
            Feature::InterviewKit => "interview_kit",
            Feature::ApplyPro => "apply_pro",
            Feature::InterviewPro => "interview_pro",
        }
    }
}

/// Time-bounded feature grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub feature: Feature,
    pub plan: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGrant {
    pub plan: String,
    pub billing_cycle: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything a paid checkout session changes on the purchasing user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanActivation {
    /// Left untouched on the user when `None`.
    pub currency: Option<String>,
    pub plan: Option<PlanGrant>,
    pub entitlements: Vec<Entitlement>,
    pub extra_profile_slots: i32,
}
