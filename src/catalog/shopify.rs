use super::config::{ADMIN_ROOT, basic_auth_header, credentials_present};
use super::{CatalogError, CatalogImage, CatalogProduct, ProductCatalog};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;
use urlencoding::encode;

const PAGE_SIZE: usize = 250;

/// Shopify Admin REST client. Runs disabled (every call refused with
/// `CatalogError::Disabled`) when credentials are missing from the
/// environment, so a partially configured deploy degrades loudly instead
/// of hammering a guessed URL.
pub struct ShopifyClient {
    http: Client,
    enabled: bool,
}

impl ShopifyClient {
    pub fn from_env() -> Self {
        let enabled = credentials_present();
        if !enabled {
            warn!(
                target = "argus.catalog",
                "shopify credentials missing, catalog calls disabled"
            );
        }
        Self {
            http: build_client(),
            enabled,
        }
    }

    fn guard(&self) -> Result<(), CatalogError> {
        if self.enabled {
            Ok(())
        } else {
            warn!(
                target = "argus.catalog",
                "catalog call attempted while disabled"
            );
            Err(CatalogError::Disabled)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, CatalogError> {
        let response = self
            .http
            .get(url)
            .header("Authorization", basic_auth_header())
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| CatalogError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl ProductCatalog for ShopifyClient {
    async fn get_product_images(
        &self,
        product_ref: &str,
    ) -> Result<Vec<CatalogImage>, CatalogError> {
        self.guard()?;
        let url = format!(
            "{}/products/{}/images.json",
            ADMIN_ROOT.as_str(),
            encode(product_ref)
        );
        let payload: ImagesEnvelope = self.get_json(url).await?;
        let mut images: Vec<CatalogImage> = payload
            .images
            .into_iter()
            .map(|img| CatalogImage {
                reference: img.src,
                position: img.position,
            })
            .collect();
        images.sort_by_key(|img| img.position);
        Ok(images)
    }

    async fn get_product(&self, product_ref: &str) -> Result<CatalogProduct, CatalogError> {
        self.guard()?;
        let url = format!(
            "{}/products/{}.json",
            ADMIN_ROOT.as_str(),
            encode(product_ref)
        );
        let payload: ProductEnvelope = self.get_json(url).await?;
        Ok(payload.product.into())
    }

    async fn get_all_products(&self) -> Result<Vec<CatalogProduct>, CatalogError> {
        self.guard()?;
        let mut products = Vec::new();
        let mut since_id = 0u64;
        loop {
            let url = format!(
                "{}/products.json?limit={PAGE_SIZE}&since_id={since_id}",
                ADMIN_ROOT.as_str()
            );
            let page: ProductsEnvelope = self.get_json(url).await?;
            if page.products.is_empty() {
                break;
            }
            since_id = page.products.iter().map(|p| p.id).max().unwrap_or(since_id);
            let full_page = page.products.len() == PAGE_SIZE;
            products.extend(page.products.into_iter().map(CatalogProduct::from));
            if !full_page {
                break;
            }
        }
        Ok(products)
    }

    async fn update_product_images(
        &self,
        product_ref: &str,
        images: &[String],
    ) -> Result<(), CatalogError> {
        self.guard()?;
        let url = format!(
            "{}/products/{}/images.json",
            ADMIN_ROOT.as_str(),
            encode(product_ref)
        );
        let body = UpdateImagesRequest {
            images: images.iter().map(|src| ImageSrc { src }).collect(),
        };
        let response = self
            .http
            .put(url)
            .header("Authorization", basic_auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn verify_connection(&self) -> bool {
        if self.guard().is_err() {
            return false;
        }
        let url = format!("{}/shop.json", ADMIN_ROOT.as_str());
        match self
            .http
            .get(url)
            .header("Authorization", basic_auth_header())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Deserialize)]
struct ImagesEnvelope {
    #[serde(default)]
    images: Vec<ShopifyImage>,
}

#[derive(Debug, Deserialize)]
struct ShopifyImage {
    src: String,
    #[serde(default)]
    position: u32,
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    product: ShopifyProduct,
}

#[derive(Debug, Deserialize)]
struct ProductsEnvelope {
    #[serde(default)]
    products: Vec<ShopifyProduct>,
}

#[derive(Debug, Deserialize)]
struct ShopifyProduct {
    id: u64,
    #[serde(default)]
    title: String,
    /// Shopify serializes tags as one comma-separated string.
    #[serde(default)]
    tags: String,
}

impl From<ShopifyProduct> for CatalogProduct {
    fn from(product: ShopifyProduct) -> Self {
        Self {
            id: product.id.to_string(),
            title: product.title,
            tags: split_tags(&product.tags),
        }
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Serialize)]
struct UpdateImagesRequest<'a> {
    images: Vec<ImageSrc<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageSrc<'a> {
    src: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_string_splits_on_commas() {
        assert_eq!(
            split_tags("Supplier:apify, Clothing ,  Sale"),
            vec!["Supplier:apify", "Clothing", "Sale"]
        );
        assert!(split_tags("").is_empty());
        assert!(split_tags(" , ,").is_empty());
    }

    #[test]
    fn shopify_product_maps_to_catalog_product() {
        let raw = r#"{"id": 812, "title": "Blue Hoodie", "tags": "Clothing, Winter"}"#;
        let product: ShopifyProduct = serde_json::from_str(raw).unwrap();
        let mapped = CatalogProduct::from(product);
        assert_eq!(mapped.id, "812");
        assert_eq!(mapped.title, "Blue Hoodie");
        assert_eq!(mapped.tags, vec!["Clothing", "Winter"]);
    }
}
