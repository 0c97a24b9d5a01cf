//! What a paid checkout session does to the purchasing user.
//!
//! Metadata is written by the checkout page as flat string pairs. `plan_activation`
//! is a pure function of that metadata and the clock; `CheckoutEffects` applies it
//! together with the referral conversion, emails and the payment log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::fulfillment::FulfillmentEffects;
use crate::billing::stripe::CheckoutSession;
use crate::errors::AppError;
use crate::models::billing::{
    Entitlement, Feature, FulfillmentMarker, PaymentLog, PlanActivation, PlanGrant,
};
use crate::notify::{notify_best_effort, templates, Notification, Notifier};
use crate::referrals::conversion::record_conversion;
use crate::store::{BillingStore, ReferralStore};

const DEFAULT_CURRENCY: &str = "USD";
const PROFILE_SLOT_ADDON: &str = "profile_slot";
const APPLY_PRO_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingCycle {
    SixMonth,
    Quarterly,
    Monthly,
    Basic,
    OneDay,
    InterviewGyani,
}

impl BillingCycle {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sixMonth" => Some(BillingCycle::SixMonth),
            "quarterly" => Some(BillingCycle::Quarterly),
            "monthly" => Some(BillingCycle::Monthly),
            "basic" => Some(BillingCycle::Basic),
            "oneDay" => Some(BillingCycle::OneDay),
            "interview_gyani" => Some(BillingCycle::InterviewGyani),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::SixMonth => "sixMonth",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::Monthly => "monthly",
            BillingCycle::Basic => "basic",
            BillingCycle::OneDay => "oneDay",
            BillingCycle::InterviewGyani => "interview_gyani",
        }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingCycle::SixMonth => add_months(now, 6),
            BillingCycle::Quarterly => add_months(now, 3),
            BillingCycle::Monthly => add_months(now, 1),
            BillingCycle::Basic => now + Duration::days(7),
            BillingCycle::OneDay => now + Duration::days(3),
            BillingCycle::InterviewGyani => now + Duration::days(30),
        }
    }

    /// Subscription cycles: eligible for bundled add-ons and referral conversion.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            BillingCycle::Monthly | BillingCycle::Quarterly | BillingCycle::SixMonth
        )
    }

    fn includes_apply_pro(&self) -> bool {
        matches!(self, BillingCycle::Quarterly | BillingCycle::SixMonth)
    }

    fn display_name(&self) -> &'static str {
        match self {
            BillingCycle::OneDay => "Quick Start Pass",
            BillingCycle::Basic => "Starter Plan",
            BillingCycle::Monthly => "Pro Monthly Plan",
            BillingCycle::Quarterly => "Pro Quarterly Plan",
            BillingCycle::SixMonth => "Pro 6-Month Plan",
            BillingCycle::InterviewGyani => "AI Interview Pro",
        }
    }
}

fn add_months(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_add_months(Months::new(months))
        .unwrap_or_else(|| now + Duration::days(30 * i64::from(months)))
}

fn job_tracker_months(duration: &str) -> Option<u32> {
    match duration {
        "1month" => Some(1),
        "3months" => Some(3),
        "6months" => Some(6),
        _ => None,
    }
}

/// Integer prefix of `raw`, so `"14.99"` reads as 14. `None` without leading digits.
fn leading_integer(raw: &str) -> Option<i64> {
    let digits_start = usize::from(raw.starts_with(['-', '+']));
    let end = raw[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(raw.len(), |i| i + digits_start);
    raw[..end].parse().ok()
}

/// Typed view over checkout session metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckoutMetadata {
    pub user_id: Option<Uuid>,
    pub billing_cycle: Option<String>,
    pub plan_to_set: Option<String>,
    pub include_job_tracker: bool,
    pub include_interview_kit: bool,
    pub include_apply_pro: bool,
    pub referral_code: Option<String>,
    pub selected_discount: f64,
    pub is_standalone_addon: bool,
    pub addon_param: Option<String>,
    pub is_job_tracker_only: bool,
    pub job_tracker_duration: Option<String>,
    pub currency: String,
    pub final_amount: Option<i64>,
    pub payment_name: Option<String>,
    pub payment_email: Option<String>,
    pub payment_phone: Option<String>,
    pub coupon_code: Option<String>,
    pub attribution: Value,
}

impl CheckoutMetadata {
    pub fn from_map(meta: &HashMap<String, String>) -> Self {
        let text = |key: &str| {
            meta.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let flag = |key: &str| meta.get(key).is_some_and(|v| v == "true");

        let mut attribution = Map::new();
        attribution.insert(
            "source".to_string(),
            Value::from(text("acqSource").unwrap_or_else(|| "direct".to_string())),
        );
        attribution.insert(
            "medium".to_string(),
            Value::from(text("acqMedium").unwrap_or_else(|| "none".to_string())),
        );
        for (key, field) in [
            ("acqCampaign", "campaign"),
            ("acqTerm", "term"),
            ("acqContent", "content"),
            ("gclid", "gclid"),
            ("fbclid", "fbclid"),
        ] {
            attribution.insert(field.to_string(), text(key).map_or(Value::Null, Value::from));
        }

        Self {
            user_id: text("userId").and_then(|v| Uuid::parse_str(&v).ok()),
            billing_cycle: text("billingCycle"),
            plan_to_set: text("planToSet"),
            include_job_tracker: flag("includeJobTracker"),
            include_interview_kit: flag("includeInterviewKit"),
            include_apply_pro: flag("includeApplyPro"),
            referral_code: text("referralCode"),
            selected_discount: text("selectedDiscount")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            is_standalone_addon: flag("isStandaloneAddon"),
            addon_param: text("addonParam"),
            is_job_tracker_only: flag("isJobTrackerOnly"),
            job_tracker_duration: text("jobTrackerDuration"),
            currency: text("effectiveCurrency").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            final_amount: text("finalAmount").and_then(|v| leading_integer(&v)),
            payment_name: text("paymentName"),
            payment_email: text("paymentEmail"),
            payment_phone: text("paymentPhone"),
            coupon_code: text("couponCode"),
            attribution: Value::Object(attribution),
        }
    }

    pub fn cycle(&self) -> Option<BillingCycle> {
        self.billing_cycle.as_deref().and_then(BillingCycle::parse)
    }

    pub fn is_profile_slot(&self) -> bool {
        self.is_standalone_addon && self.addon_param.as_deref() == Some(PROFILE_SLOT_ADDON)
    }

    fn is_job_tracker_purchase(&self) -> bool {
        self.is_job_tracker_only && self.job_tracker_duration.is_some()
    }

    pub fn purchase_kind(&self) -> String {
        match (self.is_standalone_addon, &self.addon_param) {
            (true, Some(addon)) => format!("addon_{addon}"),
            _ => "plan_purchase".to_string(),
        }
    }
}

/// Plan, add-on and slot changes for a paid session. Pure; the caller persists it.
pub fn plan_activation(meta: &CheckoutMetadata, now: DateTime<Utc>) -> PlanActivation {
    if meta.is_job_tracker_purchase() {
        let duration = meta.job_tracker_duration.clone().unwrap_or_default();
        let expires_at = match job_tracker_months(&duration) {
            Some(months) => add_months(now, months),
            None => {
                warn!(duration = %duration, "Unknown job tracker duration; granting no time");
                now
            }
        };
        return PlanActivation {
            currency: Some(meta.currency.clone()),
            plan: None,
            entitlements: vec![Entitlement {
                feature: Feature::JobTracker,
                plan: duration,
                expires_at,
            }],
            extra_profile_slots: 0,
        };
    }

    if meta.is_profile_slot() {
        return PlanActivation {
            currency: None,
            plan: None,
            entitlements: Vec::new(),
            extra_profile_slots: 1,
        };
    }

    let cycle_name = meta.billing_cycle.clone().unwrap_or_default();
    let Some(cycle) = meta.cycle() else {
        warn!(billing_cycle = %cycle_name, "Unknown billing cycle; plan expires immediately");
        return PlanActivation {
            currency: Some(meta.currency.clone()),
            plan: meta.plan_to_set.clone().map(|plan| PlanGrant {
                plan,
                billing_cycle: cycle_name,
                expires_at: now,
            }),
            entitlements: Vec::new(),
            extra_profile_slots: 0,
        };
    };
    let expires_at = cycle.expires_at(now);

    let mut entitlements = Vec::new();
    let plan = if cycle == BillingCycle::InterviewGyani {
        entitlements.push(Entitlement {
            feature: Feature::InterviewPro,
            plan: cycle.as_str().to_string(),
            expires_at,
        });
        None
    } else {
        meta.plan_to_set.clone().map(|plan| PlanGrant {
            plan,
            billing_cycle: cycle.as_str().to_string(),
            expires_at,
        })
    };

    if cycle.is_subscription() {
        let addons = [
            (meta.include_job_tracker, Feature::JobTracker),
            (meta.include_interview_kit, Feature::InterviewKit),
        ];
        for (_, feature) in addons.into_iter().filter(|(wanted, _)| *wanted) {
            entitlements.push(Entitlement {
                feature,
                plan: cycle.as_str().to_string(),
                expires_at,
            });
        }
    }
    if meta.include_apply_pro && cycle.includes_apply_pro() {
        entitlements.push(Entitlement {
            feature: Feature::ApplyPro,
            plan: cycle.as_str().to_string(),
            expires_at: now + Duration::days(APPLY_PRO_DAYS),
        });
    }

    PlanActivation {
        currency: Some(meta.currency.clone()),
        plan,
        entitlements,
        extra_profile_slots: 0,
    }
}

/// A paid session with a known purchaser, ready for fulfillment.
#[derive(Debug, Clone)]
pub struct PaidOrder {
    pub session_id: String,
    pub user_id: Uuid,
    pub amount: i64,
    pub payment_id: Option<String>,
    pub metadata: CheckoutMetadata,
}

impl PaidOrder {
    pub fn from_session(session: &CheckoutSession) -> Result<Self, AppError> {
        let mut metadata = CheckoutMetadata::from_map(&session.metadata);
        if let Some(customer) = &session.customer_details {
            metadata.payment_email = metadata.payment_email.or_else(|| customer.email.clone());
            metadata.payment_name = metadata.payment_name.or_else(|| customer.name.clone());
        }
        let user_id = metadata.user_id.ok_or_else(|| {
            AppError::Validation(format!("No userId in metadata of session {}", session.id))
        })?;
        Ok(Self {
            session_id: session.id.clone(),
            user_id,
            // A zero final amount falls back to the session total.
            amount: metadata
                .final_amount
                .filter(|amount| *amount != 0)
                .or(session.amount_total)
                .unwrap_or_default(),
            payment_id: session.payment_intent.clone(),
            metadata,
        })
    }

    pub fn marker(&self, now: DateTime<Utc>) -> FulfillmentMarker {
        FulfillmentMarker {
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            plan: self.metadata.plan_to_set.clone(),
            billing_cycle: self.metadata.billing_cycle.clone(),
            amount: self.amount,
            currency: self.metadata.currency.clone(),
            fulfilled: true,
            fulfilled_at: Some(now),
        }
    }

    pub fn success_log(&self, now: DateTime<Utc>) -> PaymentLog {
        let meta = &self.metadata;
        PaymentLog {
            id: Uuid::new_v4(),
            user_id: Some(self.user_id),
            kind: meta.purchase_kind(),
            session_id: self.session_id.clone(),
            plan: meta.plan_to_set.clone(),
            billing_cycle: meta.billing_cycle.clone(),
            amount: self.amount,
            currency: meta.currency.clone(),
            payment_id: self.payment_id.clone(),
            coupon_code: meta.coupon_code.clone(),
            discount: meta.selected_discount,
            status: "success".to_string(),
            attribution: meta.attribution.clone(),
            created_at: now,
        }
    }

    /// Template data shared by the purchase emails.
    fn email_data(&self, first_name_fallback: &str) -> Map<String, Value> {
        let meta = &self.metadata;
        let mut data = Map::new();
        data.insert("amount".to_string(), json!(self.amount));
        data.insert(
            "firstName".to_string(),
            json!(meta.payment_name.as_deref().unwrap_or(first_name_fallback)),
        );
        data.insert(
            "email".to_string(),
            json!(meta.payment_email.as_deref().unwrap_or_default()),
        );
        data.insert("currency".to_string(), json!(meta.currency));
        data.insert("isUSDomain".to_string(), json!(meta.currency == DEFAULT_CURRENCY));
        data
    }

    fn emails(&self) -> Vec<Notification> {
        let meta = &self.metadata;
        let cycle_name = meta.billing_cycle.as_deref().unwrap_or_default();
        let mut out = Vec::new();

        if !meta.is_profile_slot() {
            let mut data = self.email_data("Friend");
            data.insert("plan".to_string(), json!(meta.plan_to_set));
            data.insert("hasJobSearch".to_string(), json!(meta.include_job_tracker));
            data.insert("hasInterviewKit".to_string(), json!(meta.include_interview_kit));
            data.insert("billingCycle".to_string(), json!(cycle_name));
            out.push(Notification::to_user(
                templates::PAYMENT_COMPLETE,
                self.user_id,
                Value::Object(data),
            ));
        }

        let plan_name = if meta.is_profile_slot() {
            "Profile Slot Add-on"
        } else {
            meta.cycle().map_or("Premium", |c| c.display_name())
        };
        let mut invoice = self.email_data("Customer");
        invoice.insert("finalAmount".to_string(), json!(self.amount));
        invoice.insert("plan".to_string(), json!(meta.plan_to_set));
        invoice.insert("planName".to_string(), json!(plan_name));
        let invoice_cycle = if meta.is_profile_slot() {
            "Lifetime"
        } else {
            cycle_name
        };
        invoice.insert("billingCycle".to_string(), json!(invoice_cycle));
        invoice.insert("hasJobSearch".to_string(), json!(meta.include_job_tracker));
        invoice.insert("hasInterviewKit".to_string(), json!(meta.include_interview_kit));
        invoice.insert("hasApplyPro".to_string(), json!(meta.include_apply_pro));
        out.push(Notification::to_user(
            templates::INVOICE,
            self.user_id,
            Value::Object(invoice),
        ));

        if meta.is_profile_slot() {
            out.push(Notification::to_user(
                templates::PROFILE_SLOT_PURCHASED,
                self.user_id,
                Value::Object(self.email_data("Friend")),
            ));
        }
        out
    }
}

/// Audit row for a delayed payment method that ultimately failed.
pub fn async_failure_log(session: &CheckoutSession, now: DateTime<Utc>) -> PaymentLog {
    let meta = CheckoutMetadata::from_map(&session.metadata);
    PaymentLog {
        id: Uuid::new_v4(),
        user_id: meta.user_id,
        kind: "async_payment_failed".to_string(),
        session_id: session.id.clone(),
        plan: meta.plan_to_set,
        billing_cycle: meta.billing_cycle,
        amount: meta.final_amount.or(session.amount_total).unwrap_or_default(),
        currency: meta.currency,
        payment_id: session.payment_intent.clone(),
        coupon_code: meta.coupon_code,
        discount: meta.selected_discount,
        status: "failed".to_string(),
        attribution: meta.attribution,
        created_at: now,
    }
}

/// Side effects of a paid checkout, applied once per session by the fulfillment gate.
pub struct CheckoutEffects<'a> {
    pub billing: &'a dyn BillingStore,
    pub referrals: &'a dyn ReferralStore,
    pub notifier: &'a dyn Notifier,
}

#[async_trait]
impl<'a> FulfillmentEffects for CheckoutEffects<'a> {
    async fn apply(&self, order: &PaidOrder) -> Result<(), AppError> {
        let now = Utc::now();
        let meta = &order.metadata;

        let activation = plan_activation(meta, now);
        self.billing.activate_plan(order.user_id, &activation).await?;
        info!(
            user_id = %order.user_id,
            session_id = %order.session_id,
            plan = ?meta.plan_to_set,
            billing_cycle = ?meta.billing_cycle,
            "Checkout activated"
        );

        if let (Some(_), Some(cycle)) = (&meta.referral_code, meta.cycle()) {
            if cycle.is_subscription() {
                match record_conversion(
                    self.referrals,
                    self.notifier,
                    order.user_id,
                    cycle.as_str(),
                    order.amount,
                )
                .await
                {
                    Ok(outcome) => info!(user_id = %order.user_id, ?outcome, "Referral conversion from checkout"),
                    Err(e) => error!(user_id = %order.user_id, "Referral conversion failed: {e}"),
                }
            }
        }

        for email in order.emails() {
            notify_best_effort(self.notifier, email).await;
        }

        self.billing.append_payment_log(&order.success_log(now)).await?;
        Ok(())
    }
}
