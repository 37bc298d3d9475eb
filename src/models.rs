use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;

/// One reviewable unit: the original images of a product paired with the
/// processed candidates, plus its review status.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: i64,
    pub product_ref: String,
    pub variant_tag: Option<String>,
    pub original_images: Vec<String>,
    pub processed_images: Vec<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product-update notification body. Shopify sends the product id as a
/// number; replayed or hand-crafted deliveries often carry a string.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductUpdateEvent {
    pub id: ProductRef,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Number(u64),
    Text(String),
}

impl ProductRef {
    pub fn into_string(self) -> String {
        match self {
            ProductRef::Number(value) => value.to_string(),
            ProductRef::Text(value) => value.trim().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebhookAck {
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    ProcessingStarted,
    Error,
    ShopifyDisabled,
}

/// One page of the pending-review listing.
#[derive(Debug, Serialize)]
pub struct PendingPage {
    pub items: Vec<ApprovalRecord>,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl PendingPage {
    pub fn slice(all: Vec<ApprovalRecord>, page: usize, per_page: usize) -> Self {
        let per_page = per_page.clamp(1, 100);
        let total_items = all.len();
        let total_pages = total_items.div_ceil(per_page).max(1);
        let page = page.clamp(1, total_pages);
        let start = (page - 1) * per_page;
        let items = all
            .into_iter()
            .skip(start)
            .take(per_page)
            .collect::<Vec<_>>();
        Self {
            items,
            page,
            per_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_ref_accepts_numeric_and_text_ids() {
        let event: ProductUpdateEvent =
            serde_json::from_str(r#"{"id": 8123, "tags": ["Supplier:apify"]}"#).unwrap();
        assert_eq!(event.id.into_string(), "8123");

        let event: ProductUpdateEvent = serde_json::from_str(r#"{"id": "gid-42"}"#).unwrap();
        assert_eq!(event.id.into_string(), "gid-42");
        assert!(event.tags.is_empty());
    }

    #[test]
    fn pending_page_clamps_out_of_range_pages() {
        let records: Vec<ApprovalRecord> = (0..45)
            .map(|n| ApprovalRecord {
                id: n,
                product_ref: format!("p-{n}"),
                variant_tag: None,
                original_images: vec![],
                processed_images: vec![],
                status: ApprovalStatus::Pending,
                created_at: Utc::now(),
                approved_at: None,
                reject_reason: None,
            })
            .collect();

        let page = PendingPage::slice(records, 9, 20);
        assert_eq!(page.page, 3);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.total_items, 45);
    }

    #[test]
    fn pending_page_empty_listing_is_one_page() {
        let page = PendingPage::slice(vec![], 1, 20);
        assert_eq!(page.total_pages, 1);
        assert!(page.items.is_empty());
    }
}
