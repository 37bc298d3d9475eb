use crate::gateway::{ImageModel, ModelError};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub base_url: String,
    pub api_token: Option<String>,
}

impl ReplicateConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("REPLICATE_BASE_URL")
                .unwrap_or_else(|_| "https://api.replicate.com/v1".into()),
            api_token: std::env::var("REPLICATE_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        }
    }
}

/// Replicate predictions client. Without an API token it runs offline and
/// synthesizes deterministic outputs, so the whole pipeline stays
/// exercisable in development.
pub struct ReplicateClient {
    http: Client,
    config: ReplicateConfig,
}

impl ReplicateClient {
    pub fn new(config: ReplicateConfig) -> Self {
        if config.api_token.is_none() {
            info!(
                target = "argus.replicate",
                "no REPLICATE_API_TOKEN, model calls run in offline mode"
            );
        }
        Self {
            http: build_client(),
            config,
        }
    }

    async fn run_live(
        &self,
        token: &str,
        operation_id: &str,
        input: &Value,
    ) -> Result<Value, ModelError> {
        let base = self.config.base_url.trim_end_matches('/');
        let body = PredictionRequest { input };
        let response = self
            .http
            .post(format!("{base}/models/{operation_id}/predictions"))
            .bearer_auth(token)
            // Blocks until the prediction settles instead of polling.
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::Http(format!("HTTP {}", response.status())));
        }

        let payload: PredictionResponse = response
            .json()
            .await
            .map_err(|err| ModelError::InvalidResponse(err.to_string()))?;

        match (payload.status.as_str(), payload.output) {
            ("succeeded", Some(output)) => Ok(output),
            ("succeeded", None) => Err(ModelError::InvalidResponse("missing output".into())),
            (status, _) => Err(ModelError::InvalidResponse(format!(
                "prediction {status}: {}",
                payload
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no error detail".into())
            ))),
        }
    }

    fn run_offline(operation_id: &str, input: &Value) -> Value {
        let source = input
            .get("image")
            .and_then(Value::as_str)
            .unwrap_or("https://placeholder.invalid/source.jpg");
        let slug = operation_id.replace('/', "-");
        let derived = if source.contains('?') {
            format!("{source}&render={slug}")
        } else {
            format!("{source}?render={slug}")
        };
        json!([derived])
    }
}

#[async_trait]
impl ImageModel for ReplicateClient {
    async fn run(&self, operation_id: &str, input: &Value) -> Result<Value, ModelError> {
        match self.config.api_token.as_deref() {
            Some(token) => self.run_live(token, operation_id, input).await,
            None => Ok(Self::run_offline(operation_id, input)),
        }
    }
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    input: &'a Value,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}
