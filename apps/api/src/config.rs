use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Redis list the notification outbox pushes onto.
    pub notification_queue: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    /// Base URL of the transactional email service (`POST {base}/api/send-email`).
    pub email_service_url: String,
    /// Shared secret for operator-only endpoints (`x-admin-token`).
    pub admin_token: String,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            notification_queue: std::env::var("NOTIFICATION_QUEUE")
                .unwrap_or_else(|_| "notifications:outbox".to_string()),
            stripe_secret_key: require_env("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            email_service_url: require_env("EMAIL_SERVICE_URL")?,
            admin_token: require_env("ADMIN_TOKEN")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Config {
            database_url: "postgres://localhost/ledger_test".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            notification_queue: "notifications:test".to_string(),
            stripe_secret_key: "sk_test_xxx".to_string(),
            stripe_webhook_secret: "whsec_test123secret456".to_string(),
            email_service_url: "http://localhost:3001".to_string(),
            admin_token: "admin-secret".to_string(),
            port: 8080,
            rust_log: "debug".to_string(),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
