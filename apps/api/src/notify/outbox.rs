//! Redis-list outbox and the dispatcher that drains it.
//!
//! Publishing is an `RPUSH` of the JSON-encoded notification; the dispatcher
//! `BLPOP`s, hands each message to the email client, and parks messages that
//! still fail after the client's retries on `<queue>:dead`.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{error, info, warn};

use crate::notify::email::EmailClient;
use crate::notify::{Notification, Notifier, NotifyError};

const POP_TIMEOUT_SECS: f64 = 5.0;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub fn dead_letter_key(queue: &str) -> String {
    format!("{queue}:dead")
}

#[derive(Clone)]
pub struct RedisOutbox {
    client: redis::Client,
    queue: String,
}

impl RedisOutbox {
    pub fn new(client: redis::Client, queue: &str) -> Self {
        Self {
            client,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for RedisOutbox {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(notification)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.rpush::<_, _, ()>(&self.queue, payload).await?;
        Ok(())
    }
}

/// Runs forever, delivering queued notifications. Connection loss is retried.
pub async fn run_dispatcher(client: redis::Client, queue: String, email: EmailClient) {
    info!("Notification dispatcher draining '{queue}'");
    let dead_letters = dead_letter_key(&queue);

    loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Dispatcher cannot reach Redis: {e}; retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            let popped: Option<(String, String)> =
                match conn.blpop(&queue, POP_TIMEOUT_SECS).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        warn!("Dispatcher lost Redis connection: {e}");
                        break;
                    }
                };
            let Some((_, payload)) = popped else {
                continue;
            };

            let delivered = match serde_json::from_str::<Notification>(&payload) {
                Ok(notification) => match email.send(&notification).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(template = %notification.template_id, "Notification undeliverable: {e}");
                        false
                    }
                },
                Err(e) => {
                    error!("Malformed outbox message: {e}");
                    false
                }
            };

            if !delivered {
                if let Err(e) = conn.rpush::<_, _, ()>(&dead_letters, &payload).await {
                    error!("Failed to park message on {dead_letters}: {e}");
                }
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
