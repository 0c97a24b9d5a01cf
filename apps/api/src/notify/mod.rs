//! Outbound notifications.
//!
//! Ledger and billing code publish `Notification`s through the `Notifier` seam and
//! never wait on delivery. In production the notifier is the Redis outbox; a
//! background dispatcher drains it into the email service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod email;
pub mod outbox;

/// Template ids understood by the email service.
pub mod templates {
    pub const REFERRAL_CONVERSION: &str = "referral_conversion";
    pub const REFERRAL_INVITE: &str = "referral_invite";
    pub const PAYMENT_COMPLETE: &str = "paymentComplete";
    pub const INVOICE: &str = "invoice";
    pub const PROFILE_SLOT_PURCHASED: &str = "profile_slot_purchased";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn to_user(template_id: &str, user_id: Uuid, data: Value) -> Self {
        Self {
            template_id: template_id.to_string(),
            user_id: Some(user_id),
            email: None,
            data,
        }
    }

    pub fn to_email(template_id: &str, email: &str, data: Value) -> Self {
        Self {
            template_id: template_id.to_string(),
            user_id: None,
            email: Some(email.to_string()),
            data,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Email service error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Publishes and swallows failures. A notification problem never unwinds the
/// state change that triggered it.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.publish(&notification).await {
        warn!(
            template = %notification.template_id,
            user_id = ?notification.user_id,
            "Notification publish failed (ignored): {e}"
        );
    }
}
