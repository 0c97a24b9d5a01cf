//! HTTP client for the transactional email service.
//!
//! The only component that talks to the email service. Retries on 429 / 5xx and
//! transport errors with exponential backoff; 4xx responses are final.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::notify::{Notification, NotifyError};

const SEND_PATH: &str = "/api/send-email";
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct EmailClient {
    client: Client,
    base_url: String,
}

impl EmailClient {
    pub fn new(base_url: &str) -> Result<Self, NotifyError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, SEND_PATH)
    }

    pub async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let url = self.endpoint();
        let mut last_error: Option<NotifyError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Email send attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self.client.post(&url).json(notification).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(NotifyError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(NotifyError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NotifyError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }

            debug!(template = %notification.template_id, "Email delivered");
            return Ok(());
        }

        Err(last_error.unwrap_or(NotifyError::Api {
            status: 0,
            message: format!("gave up after {MAX_RETRIES} attempts"),
        }))
    }
}
