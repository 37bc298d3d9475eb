use crate::gateway::ProcessingGateway;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

/// Tag marker for supplier feeds whose photos are multi-angle composites.
const APIFY_SUPPLIER_TAG: &str = "Supplier:apify";

const CLOTHING_KEYWORDS: [&str; 10] = [
    "shirt", "dress", "pants", "jacket", "hoodie", "sweater", "jeans", "blouse", "skirt", "shorts",
];

/// Hard cap on processed images per product, regardless of strategy.
const MAX_OUTPUT_IMAGES: usize = 5;
/// Composite splitting only looks at the first few originals.
const MAX_SPLIT_SOURCES: usize = 3;

const ANGLE_SPLIT_OP: &str = "adirik/sam";
const ANGLE_SPLIT_COST_USD: f64 = 0.002;
const RENDER_OP: &str = "stability-ai/sdxl";
const LIFESTYLE_COST_USD: f64 = 0.008;
const SWATCH_GRID_COST_USD: f64 = 0.005;

const LIFESTYLE_PROMPT: &str = "Professional lifestyle photo of a model wearing this clothing \
                                item, studio lighting, high quality, commercial product photography";
const SWATCH_GRID_PROMPT: &str = "Minimalist grid layout of clothing color swatches on white \
                                  background, professional product photography";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MultiAngle,
    Clothing,
    Standard,
}

impl Strategy {
    /// First match wins: supplier marker, then clothing keywords in the
    /// title or tags, then the standard badge path.
    pub fn detect(title: &str, tags: &[String]) -> Self {
        if tags.iter().any(|tag| tag.trim() == APIFY_SUPPLIER_TAG) {
            return Strategy::MultiAngle;
        }
        let title = title.to_lowercase();
        if CLOTHING_KEYWORDS.iter().any(|keyword| {
            title.contains(keyword)
                || tags.iter().any(|tag| tag.to_lowercase().contains(keyword))
        }) {
            return Strategy::Clothing;
        }
        Strategy::Standard
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedSet {
    pub strategy: Strategy,
    pub images: Vec<String>,
}

/// Turns a product's original images into review candidates. Every failure
/// inside a strategy degrades to passing original references through;
/// nothing escapes this boundary. Given at least one input image the
/// output is non-empty and never longer than five entries.
pub struct ImageSetProcessor {
    gateway: Arc<ProcessingGateway>,
}

impl ImageSetProcessor {
    pub fn new(gateway: Arc<ProcessingGateway>) -> Self {
        Self { gateway }
    }

    pub async fn process(
        &self,
        product_ref: &str,
        title: &str,
        tags: &[String],
        images: &[String],
    ) -> ProcessedSet {
        let strategy = Strategy::detect(title, tags);
        if images.is_empty() {
            return ProcessedSet {
                strategy,
                images: Vec::new(),
            };
        }

        let mut processed = match strategy {
            Strategy::MultiAngle => self.split_angles(product_ref, images).await,
            Strategy::Clothing => self.clothing_gallery(product_ref, images).await,
            Strategy::Standard => badge_overlays(images),
        };
        processed.truncate(MAX_OUTPUT_IMAGES);
        ProcessedSet {
            strategy,
            images: processed,
        }
    }

    /// Splits composite supplier photos into per-angle shots. A failed or
    /// empty split keeps the source image in the set instead.
    async fn split_angles(&self, product_ref: &str, images: &[String]) -> Vec<String> {
        let mut collected = Vec::new();
        for image in images.iter().take(MAX_SPLIT_SOURCES) {
            let outcome = self
                .gateway
                .invoke(ANGLE_SPLIT_OP, &json!({ "image": image }), ANGLE_SPLIT_COST_USD)
                .await;
            match outcome {
                Ok(output) => {
                    let angles = output_urls(&output);
                    if angles.is_empty() {
                        warn!(
                            target = "argus.processor",
                            product_ref,
                            image,
                            "split_returned_nothing_usable"
                        );
                        collected.push(image.clone());
                    } else {
                        collected.extend(angles);
                    }
                }
                Err(err) => {
                    warn!(
                        target = "argus.processor",
                        product_ref,
                        image,
                        error = %err,
                        "split_failed"
                    );
                    collected.push(image.clone());
                }
            }
        }
        collected
    }

    /// One lifestyle render plus one swatch grid, both referenced off the
    /// first original. Any failure falls back to the first original plus
    /// up to four of the remaining originals as swatches.
    async fn clothing_gallery(&self, product_ref: &str, images: &[String]) -> Vec<String> {
        let main_image = &images[0];
        let gallery = async {
            let lifestyle = self
                .gateway
                .invoke(
                    RENDER_OP,
                    &json!({ "image": main_image, "prompt": LIFESTYLE_PROMPT }),
                    LIFESTYLE_COST_USD,
                )
                .await?;
            let swatch_grid = self
                .gateway
                .invoke(
                    RENDER_OP,
                    &json!({ "image": main_image, "prompt": SWATCH_GRID_PROMPT }),
                    SWATCH_GRID_COST_USD,
                )
                .await?;
            Ok::<_, crate::gateway::GatewayError>((lifestyle, swatch_grid))
        }
        .await;

        match gallery {
            Ok((lifestyle, swatch_grid)) => {
                let mut out = Vec::with_capacity(2);
                out.extend(output_urls(&lifestyle).into_iter().take(1));
                out.extend(output_urls(&swatch_grid).into_iter().take(1));
                if out.len() == 2 {
                    return out;
                }
                warn!(
                    target = "argus.processor",
                    product_ref, "gallery_output_unusable"
                );
            }
            Err(err) => {
                warn!(
                    target = "argus.processor",
                    product_ref,
                    error = %err,
                    "gallery_generation_failed"
                );
            }
        }

        let mut fallback = vec![main_image.clone()];
        fallback.extend(images.iter().skip(1).take(4).cloned());
        fallback
    }
}

/// Badge compositing is delegated to the image CDN's transform parameters:
/// a locale flag in the bottom-right corner and a delivery-speed badge in
/// the top-right. An unparseable reference passes through untouched.
fn badge_overlays(images: &[String]) -> Vec<String> {
    images
        .iter()
        .take(MAX_OUTPUT_IMAGES)
        .map(|image| overlay_badges(image).unwrap_or_else(|| image.clone()))
        .collect()
}

fn overlay_badges(image: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(image).ok()?;
    url.query_pairs_mut()
        .append_pair("overlay", "uk_flag@bottom-right,fast_delivery@top-right");
    Some(url.to_string())
}

/// Model outputs arrive as a bare URL string or an array of them.
fn output_urls(output: &Value) -> Vec<String> {
    match output {
        Value::String(url) if !url.trim().is_empty() => vec![url.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
