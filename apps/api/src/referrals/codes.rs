use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::ReferralStore;

pub const CODE_LENGTH: usize = 8;
const ASSIGN_ATTEMPTS: usize = 3;

/// Codes are matched case-insensitively by storing and looking them up upper-case.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// A fresh random code: upper-case hex, `CODE_LENGTH` characters.
pub fn generate_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .to_uppercase()
        .chars()
        .take(CODE_LENGTH)
        .collect()
}

/// Returns the user's referral code, generating and storing one on first use.
pub async fn ensure_referral_code(
    store: &dyn ReferralStore,
    user_id: Uuid,
) -> Result<String, AppError> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))?;
    if let Some(code) = user.referral_code {
        return Ok(code);
    }

    for _ in 0..ASSIGN_ATTEMPTS {
        let candidate = generate_code();
        match store.assign_referral_code(user_id, &candidate).await {
            Ok(code) => {
                info!(%user_id, code = %code, "Referral code assigned");
                return Ok(code);
            }
            Err(AppError::Conflict(_)) => {
                warn!(%user_id, candidate = %candidate, "Generated referral code collided");
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::Conflict(format!(
        "Could not allocate a unique referral code for {user_id}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::referrals::fixtures::{referrer, store_with, user};

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  ranjan10 "), "RANJAN10");
        assert_eq!(normalize_code("AbC"), "ABC");
    }

    #[test]
    fn test_generated_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(normalize_code(&code), code);
    }

    #[tokio::test]
    async fn test_ensure_keeps_existing_code() {
        let owner = referrer("ref@example.com", "CODE0001");
        let store = store_with(&[&owner]).await;

        assert_eq!(ensure_referral_code(&store, owner.id).await.unwrap(), "CODE0001");
    }

    #[tokio::test]
    async fn test_ensure_generates_once() {
        let fresh = user("fresh@example.com");
        let store = store_with(&[&fresh]).await;

        let first = ensure_referral_code(&store, fresh.id).await.unwrap();
        let second = ensure_referral_code(&store, fresh.id).await.unwrap();

        assert_eq!(first.len(), CODE_LENGTH);
        assert_eq!(first, second);
        assert_eq!(store.user(fresh.id).await.unwrap().referral_code, Some(first));
    }

    #[tokio::test]
    async fn test_ensure_unknown_user() {
        let store = store_with(&[]).await;
        let err = ensure_referral_code(&store, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
