pub mod config;
pub mod shopify;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use shopify::ShopifyClient;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog disabled, missing credentials")]
    Disabled,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One image slot on a product, in display order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogImage {
    pub reference: String,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: String,
    pub title: String,
    pub tags: Vec<String>,
}

/// Read side of the product catalog. Auth and transport are the
/// implementation's concern; callers only see ordered references.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_product_images(&self, product_ref: &str)
    -> Result<Vec<CatalogImage>, CatalogError>;

    async fn get_product(&self, product_ref: &str) -> Result<CatalogProduct, CatalogError>;

    async fn get_product_tags(&self, product_ref: &str) -> Result<Vec<String>, CatalogError> {
        Ok(self.get_product(product_ref).await?.tags)
    }

    async fn get_all_products(&self) -> Result<Vec<CatalogProduct>, CatalogError>;

    /// Replaces all images on a product. Used when an approved image set
    /// is pushed back to the storefront.
    async fn update_product_images(
        &self,
        product_ref: &str,
        images: &[String],
    ) -> Result<(), CatalogError>;

    async fn verify_connection(&self) -> bool;

    fn enabled(&self) -> bool {
        true
    }
}
