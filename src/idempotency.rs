use crate::models::WebhookAck;
use redis::AsyncCommands;

/// Shopify redelivers webhooks on slow acks; when redis is configured the
/// first ack per delivery id is replayed instead of re-enqueuing the job.
pub async fn redis_get(client: &redis::Client, key: &str) -> Option<WebhookAck> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &WebhookAck, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
