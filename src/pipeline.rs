use crate::catalog::ProductCatalog;
use crate::processor::{ImageSetProcessor, Strategy};
use crate::store::{ApprovalStore, StoreError};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

/// Orchestrates one product's trip from update event to pending review:
/// skip if already waiting, fetch images, process, persist.
#[derive(Clone)]
pub struct IngestPipeline {
    catalog: Arc<dyn ProductCatalog>,
    processor: Arc<ImageSetProcessor>,
    store: ApprovalStore,
    sweep_delay: Duration,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("catalog unavailable for `{scope}`: {reason}")]
    CatalogUnavailable { scope: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestOutcome {
    Queued {
        record_id: i64,
        strategy: Strategy,
        processed_count: usize,
    },
    /// A pending record already exists; re-processing would only duplicate
    /// review work.
    SkippedPending { record_id: i64 },
    SkippedNoImages,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestSummary {
    pub total_products: usize,
    pub queued: usize,
    pub skipped_pending: usize,
    pub skipped_no_images: usize,
    pub failed: usize,
    pub multi_angle: usize,
    pub clothing: usize,
    pub standard: usize,
}

impl IngestPipeline {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        processor: Arc<ImageSetProcessor>,
        store: ApprovalStore,
    ) -> Self {
        Self {
            catalog,
            processor,
            store,
            sweep_delay: sweep_delay_from_env(),
        }
    }

    #[cfg(test)]
    fn with_sweep_delay(mut self, delay: Duration) -> Self {
        self.sweep_delay = delay;
        self
    }

    pub async fn ingest(
        &self,
        product_ref: &str,
        tags: &[String],
    ) -> Result<IngestOutcome, IngestError> {
        if let Some(existing) = self.store.find_pending_by_product(product_ref).await? {
            info!(
                target = "argus.pipeline",
                product_ref,
                record_id = existing.id,
                "already_pending_review_skipped"
            );
            return Ok(IngestOutcome::SkippedPending {
                record_id: existing.id,
            });
        }

        let images = self
            .catalog
            .get_product_images(product_ref)
            .await
            .map_err(|err| IngestError::CatalogUnavailable {
                scope: product_ref.to_string(),
                reason: err.to_string(),
            })?;
        if images.is_empty() {
            warn!(
                target = "argus.pipeline",
                product_ref, "no_catalog_images_skipped"
            );
            return Ok(IngestOutcome::SkippedNoImages);
        }

        // The title only steers strategy routing; a failed lookup must
        // not abort the ingestion.
        let (title, catalog_tags) = match self.catalog.get_product(product_ref).await {
            Ok(product) => (product.title, product.tags),
            Err(err) => {
                warn!(
                    target = "argus.pipeline",
                    product_ref,
                    error = %err,
                    "product_lookup_failed_routing_on_event_tags"
                );
                (String::new(), Vec::new())
            }
        };
        let tags = if tags.is_empty() {
            catalog_tags.as_slice()
        } else {
            tags
        };

        let originals: Vec<String> = images.into_iter().map(|img| img.reference).collect();
        let set = self
            .processor
            .process(product_ref, &title, tags, &originals)
            .await;

        let variant_tag = if tags.is_empty() {
            None
        } else {
            Some(tags.join(", "))
        };
        let record_id = self
            .store
            .add_pending(product_ref, &originals, &set.images, variant_tag)
            .await?;

        info!(
            target = "argus.pipeline",
            product_ref,
            record_id,
            strategy = ?set.strategy,
            originals = originals.len(),
            processed = set.images.len(),
            "queued_for_review"
        );
        Ok(IngestOutcome::Queued {
            record_id,
            strategy: set.strategy,
            processed_count: set.images.len(),
        })
    }

    /// Sweeps the whole catalog through `ingest`, pacing items to respect
    /// upstream rate limits. Per-item failures are counted, never fatal.
    pub async fn ingest_all(&self) -> Result<IngestSummary, IngestError> {
        let products =
            self.catalog
                .get_all_products()
                .await
                .map_err(|err| IngestError::CatalogUnavailable {
                    scope: "sweep".to_string(),
                    reason: err.to_string(),
                })?;

        let mut summary = IngestSummary {
            total_products: products.len(),
            ..IngestSummary::default()
        };

        for (index, product) in products.iter().enumerate() {
            match self.ingest(&product.id, &product.tags).await {
                Ok(IngestOutcome::Queued { strategy, .. }) => {
                    summary.queued += 1;
                    match strategy {
                        Strategy::MultiAngle => summary.multi_angle += 1,
                        Strategy::Clothing => summary.clothing += 1,
                        Strategy::Standard => summary.standard += 1,
                    }
                }
                Ok(IngestOutcome::SkippedPending { .. }) => summary.skipped_pending += 1,
                Ok(IngestOutcome::SkippedNoImages) => summary.skipped_no_images += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        target = "argus.pipeline",
                        product_ref = %product.id,
                        error = %err,
                        "sweep_item_failed"
                    );
                }
            }
            if index + 1 < products.len() {
                sleep(self.paced_delay()).await;
            }
        }

        info!(
            target = "argus.pipeline",
            total = summary.total_products,
            queued = summary.queued,
            skipped_pending = summary.skipped_pending,
            skipped_no_images = summary.skipped_no_images,
            failed = summary.failed,
            "sweep_finished"
        );
        Ok(summary)
    }

    fn paced_delay(&self) -> Duration {
        if self.sweep_delay.is_zero() {
            return self.sweep_delay;
        }
        // Small jitter keeps a sweep from hitting the catalog on a strict
        // metronome.
        let jitter_ms = rand::rng().random_range(0..100);
        self.sweep_delay + Duration::from_millis(jitter_ms)
    }
}

fn sweep_delay_from_env() -> Duration {
    let ms = std::env::var("INGEST_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(500);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, CatalogImage, CatalogProduct};
    use crate::gateway::{ImageModel, ModelError, ProcessingGateway};
    use crate::ledger::CostLedger;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashMap;

    struct StaticModel;

    #[async_trait]
    impl ImageModel for StaticModel {
        async fn run(&self, operation_id: &str, input: &Value) -> Result<Value, ModelError> {
            let source = input.get("image").and_then(Value::as_str).unwrap_or("x");
            Ok(json!([format!("{source}?out={}", operation_id.replace('/', "-"))]))
        }
    }

    struct FakeCatalog {
        products: Vec<CatalogProduct>,
        images: HashMap<String, Vec<CatalogImage>>,
        fail_images: bool,
    }

    impl FakeCatalog {
        fn new() -> Self {
            Self {
                products: Vec::new(),
                images: HashMap::new(),
                fail_images: false,
            }
        }

        fn with_product(mut self, id: &str, title: &str, tags: &[&str], image_count: usize) -> Self {
            self.products.push(CatalogProduct {
                id: id.to_string(),
                title: title.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            });
            self.images.insert(
                id.to_string(),
                (0..image_count)
                    .map(|n| CatalogImage {
                        reference: format!("https://cdn.example.com/{id}-{n}.jpg"),
                        position: n as u32 + 1,
                    })
                    .collect(),
            );
            self
        }
    }

    #[async_trait]
    impl ProductCatalog for FakeCatalog {
        async fn get_product_images(
            &self,
            product_ref: &str,
        ) -> Result<Vec<CatalogImage>, CatalogError> {
            if self.fail_images {
                return Err(CatalogError::Request("HTTP 503".into()));
            }
            Ok(self.images.get(product_ref).cloned().unwrap_or_default())
        }

        async fn get_product(&self, product_ref: &str) -> Result<CatalogProduct, CatalogError> {
            self.products
                .iter()
                .find(|p| p.id == product_ref)
                .cloned()
                .ok_or_else(|| CatalogError::Request("HTTP 404".into()))
        }

        async fn get_all_products(&self) -> Result<Vec<CatalogProduct>, CatalogError> {
            Ok(self.products.clone())
        }

        async fn update_product_images(
            &self,
            _product_ref: &str,
            _images: &[String],
        ) -> Result<(), CatalogError> {
            Ok(())
        }

        async fn verify_connection(&self) -> bool {
            !self.fail_images
        }
    }

    async fn pipeline_with(
        catalog: FakeCatalog,
    ) -> (tempfile::TempDir, ApprovalStore, IngestPipeline) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ApprovalStore::new(dir.path().join("approvals.db"));
        store.init().await.expect("init store");
        let ledger = CostLedger::new(dir.path().join("costs.db"));
        ledger.init().await.expect("init ledger");
        let gateway = Arc::new(ProcessingGateway::new(Arc::new(StaticModel), ledger, 100.0));
        let processor = Arc::new(ImageSetProcessor::new(gateway));
        let pipeline = IngestPipeline::new(Arc::new(catalog), processor, store.clone())
            .with_sweep_delay(Duration::ZERO);
        (dir, store, pipeline)
    }

    #[tokio::test]
    async fn ingest_queues_pending_record_with_variant_tag() {
        let catalog =
            FakeCatalog::new().with_product("123", "Composite", &["Supplier:apify"], 4);
        let (_dir, store, pipeline) = pipeline_with(catalog).await;

        let outcome = pipeline
            .ingest("123", &["Supplier:apify".to_string()])
            .await
            .expect("ingest");
        let IngestOutcome::Queued {
            record_id,
            strategy,
            processed_count,
        } = outcome
        else {
            panic!("expected Queued, got {outcome:?}");
        };
        assert_eq!(strategy, Strategy::MultiAngle);
        assert!(processed_count >= 1 && processed_count <= 5);

        let record = store.get(record_id).await.expect("get");
        assert_eq!(record.product_ref, "123");
        assert_eq!(record.original_images.len(), 4);
        assert_eq!(record.variant_tag.as_deref(), Some("Supplier:apify"));
    }

    #[tokio::test]
    async fn second_ingest_skips_while_first_is_pending() {
        let catalog = FakeCatalog::new().with_product("7", "Widget", &[], 2);
        let (_dir, store, pipeline) = pipeline_with(catalog).await;

        let first = pipeline.ingest("7", &[]).await.expect("first ingest");
        let second = pipeline.ingest("7", &[]).await.expect("second ingest");

        let IngestOutcome::Queued { record_id, .. } = first else {
            panic!("expected Queued");
        };
        assert_eq!(second, IngestOutcome::SkippedPending { record_id });
        assert_eq!(store.list_pending().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn product_without_images_creates_no_record() {
        let catalog = FakeCatalog::new().with_product("9", "Ghost", &[], 0);
        let (_dir, store, pipeline) = pipeline_with(catalog).await;

        let outcome = pipeline.ingest("9", &[]).await.expect("ingest");
        assert_eq!(outcome, IngestOutcome::SkippedNoImages);
        assert!(store.list_pending().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn catalog_outage_surfaces_without_creating_a_record() {
        let mut catalog = FakeCatalog::new().with_product("5", "Widget", &[], 3);
        catalog.fail_images = true;
        let (_dir, store, pipeline) = pipeline_with(catalog).await;

        let err = pipeline.ingest("5", &[]).await;
        assert!(matches!(
            err,
            Err(IngestError::CatalogUnavailable { .. })
        ));
        assert!(store.list_pending().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn routing_falls_back_to_catalog_tags_when_event_has_none() {
        let catalog =
            FakeCatalog::new().with_product("88", "Mystery Box", &["Supplier:apify"], 2);
        let (_dir, _store, pipeline) = pipeline_with(catalog).await;

        let outcome = pipeline.ingest("88", &[]).await.expect("ingest");
        let IngestOutcome::Queued { strategy, .. } = outcome else {
            panic!("expected Queued");
        };
        assert_eq!(strategy, Strategy::MultiAngle);
    }

    #[tokio::test]
    async fn sweep_counts_outcomes_by_strategy() {
        let catalog = FakeCatalog::new()
            .with_product("1", "Composite Feed", &["Supplier:apify"], 3)
            .with_product("2", "Blue Hoodie", &[], 2)
            .with_product("3", "Widget", &[], 1)
            .with_product("4", "Empty", &[], 0);
        let (_dir, _store, pipeline) = pipeline_with(catalog).await;

        let summary = pipeline.ingest_all().await.expect("sweep");
        assert_eq!(summary.total_products, 4);
        assert_eq!(summary.queued, 3);
        assert_eq!(summary.skipped_no_images, 1);
        assert_eq!(summary.multi_angle, 1);
        assert_eq!(summary.clothing, 1);
        assert_eq!(summary.standard, 1);
        assert_eq!(summary.failed, 0);

        // A second sweep finds everything already pending.
        let again = pipeline.ingest_all().await.expect("second sweep");
        assert_eq!(again.queued, 0);
        assert_eq!(again.skipped_pending, 3);
    }
}
