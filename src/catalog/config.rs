use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use once_cell::sync::Lazy;
use std::env;

pub static SHOPIFY_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("SHOPIFY_API_KEY").unwrap_or_default());

pub static SHOPIFY_PASSWORD: Lazy<String> =
    Lazy::new(|| env::var("SHOPIFY_PASSWORD").unwrap_or_default());

pub static SHOPIFY_STORE_URL: Lazy<String> = Lazy::new(|| {
    env::var("SHOPIFY_STORE_URL")
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string()
});

pub static API_VERSION: Lazy<String> =
    Lazy::new(|| env::var("SHOPIFY_API_VERSION").unwrap_or_else(|_| "2023-10".to_string()));

pub static ADMIN_ROOT: Lazy<String> = Lazy::new(|| {
    format!(
        "https://{}/admin/api/{}",
        SHOPIFY_STORE_URL.as_str(),
        API_VERSION.as_str()
    )
});

pub fn credentials_present() -> bool {
    !SHOPIFY_API_KEY.is_empty() && !SHOPIFY_PASSWORD.is_empty() && !SHOPIFY_STORE_URL.is_empty()
}

/// Private apps authenticate with `api_key:password` over HTTP basic auth.
pub fn basic_auth_header() -> String {
    let raw = format!("{}:{}", SHOPIFY_API_KEY.as_str(), SHOPIFY_PASSWORD.as_str());
    format!("Basic {}", BASE64.encode(raw))
}
