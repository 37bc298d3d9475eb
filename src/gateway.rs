use crate::ledger::{CostLedger, LedgerError, micros_to_usd, usd_to_micros};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Seam to the metered AI image service. One operation, priced per call,
/// no retry contract: any non-success is terminal for that call.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn run(&self, operation_id: &str, input: &Value) -> Result<Value, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(
        "budget exhausted for `{operation}`: declared ${declared_cost:.3}, ${remaining:.3} left today"
    )]
    BudgetExceeded {
        operation: String,
        declared_cost: f64,
        remaining: f64,
    },
    #[error("upstream call `{operation}` failed: {source}")]
    UpstreamCallFailed {
        operation: String,
        #[source]
        source: ModelError,
    },
    #[error("cost ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub date: NaiveDate,
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub remaining_usd: f64,
}

/// Budget-guarded front door to the image model. Spend is checked before
/// every call and recorded only after a successful one, so a failed call
/// costs nothing on the ledger. Two in-flight calls can both pass the
/// pre-check before either charges; the daily cap is a soft limit under
/// concurrent load.
pub struct ProcessingGateway {
    model: Arc<dyn ImageModel>,
    ledger: CostLedger,
    daily_budget_micros: u64,
}

impl ProcessingGateway {
    pub fn new(model: Arc<dyn ImageModel>, ledger: CostLedger, daily_budget_usd: f64) -> Self {
        Self {
            model,
            ledger,
            daily_budget_micros: usd_to_micros(daily_budget_usd),
        }
    }

    pub fn from_env(model: Arc<dyn ImageModel>, ledger: CostLedger) -> Self {
        let budget = std::env::var("DAILY_BUDGET")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(5.00);
        Self::new(model, ledger, budget)
    }

    pub fn budget_usd(&self) -> f64 {
        micros_to_usd(self.daily_budget_micros)
    }

    /// Runs `operation_id` against the model if today's budget allows it.
    /// On `BudgetExceeded` no external call is made; on upstream failure
    /// nothing is charged. A charge, once recorded, is never refunded —
    /// the external spend has already happened by then.
    pub async fn invoke(
        &self,
        operation_id: &str,
        input: &Value,
        declared_cost_usd: f64,
    ) -> Result<Value, GatewayError> {
        let today = Utc::now().date_naive();
        let cost = usd_to_micros(declared_cost_usd);
        let spent = self.ledger.current_spend(today).await?;

        if spent.saturating_add(cost) > self.daily_budget_micros {
            let remaining = micros_to_usd(self.daily_budget_micros.saturating_sub(spent));
            warn!(
                target = "argus.gateway",
                operation = operation_id,
                declared_cost_usd,
                remaining_usd = remaining,
                "budget_refused_call"
            );
            return Err(GatewayError::BudgetExceeded {
                operation: operation_id.to_string(),
                declared_cost: declared_cost_usd,
                remaining,
            });
        }

        let output = self
            .model
            .run(operation_id, input)
            .await
            .map_err(|source| GatewayError::UpstreamCallFailed {
                operation: operation_id.to_string(),
                source,
            })?;

        let total = self.ledger.charge(today, cost).await?;
        crate::metrics::external_call(operation_id, declared_cost_usd);
        info!(
            target = "argus.gateway",
            operation = operation_id,
            declared_cost_usd,
            day_total_usd = micros_to_usd(total),
            "external_call_charged"
        );
        Ok(output)
    }

    pub async fn daily_report(&self) -> Result<CostReport, GatewayError> {
        let date = Utc::now().date_naive();
        let spent = self.ledger.current_spend(date).await?;
        Ok(CostReport {
            date,
            spent_usd: micros_to_usd(spent),
            budget_usd: micros_to_usd(self.daily_budget_micros),
            remaining_usd: micros_to_usd(self.daily_budget_micros.saturating_sub(spent)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; succeeds or fails per construction.
    struct CountingModel {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingModel {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageModel for CountingModel {
        async fn run(&self, operation_id: &str, _input: &Value) -> Result<Value, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ModelError::Http("boom".into()))
            } else {
                Ok(json!({ "operation": operation_id, "output": ["ok"] }))
            }
        }
    }

    async fn temp_ledger() -> (tempfile::TempDir, CostLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = CostLedger::new(dir.path().join("costs.db"));
        ledger.init().await.expect("init");
        (dir, ledger)
    }

    #[tokio::test]
    async fn budget_allows_exactly_625_eight_mil_calls() {
        let (_dir, ledger) = temp_ledger().await;
        let model = Arc::new(CountingModel::ok());
        let gateway = ProcessingGateway::new(model.clone(), ledger, 5.00);
        let input = json!({ "image": "https://cdn.example.com/a.jpg" });

        for call in 0..625 {
            gateway
                .invoke("stability-ai/sdxl", &input, 0.008)
                .await
                .unwrap_or_else(|err| panic!("call {call} refused: {err}"));
        }
        assert_eq!(model.call_count(), 625);

        // 625 x $0.008 == $5.00 exactly; the next call must be refused
        // without reaching the model.
        let err = gateway.invoke("stability-ai/sdxl", &input, 0.008).await;
        assert!(matches!(err, Err(GatewayError::BudgetExceeded { .. })));
        assert_eq!(model.call_count(), 625);
    }

    #[tokio::test]
    async fn upstream_failure_is_not_charged() {
        let (_dir, ledger) = temp_ledger().await;
        let gateway =
            ProcessingGateway::new(Arc::new(CountingModel::failing()), ledger.clone(), 5.00);

        let err = gateway
            .invoke("adirik/sam", &json!({ "image": "x" }), 0.002)
            .await;
        assert!(matches!(err, Err(GatewayError::UpstreamCallFailed { .. })));

        let today = Utc::now().date_naive();
        assert_eq!(ledger.current_spend(today).await.expect("spend"), 0);
    }

    #[tokio::test]
    async fn refused_call_reports_remaining_budget() {
        let (_dir, ledger) = temp_ledger().await;
        let model = Arc::new(CountingModel::ok());
        let gateway = ProcessingGateway::new(model.clone(), ledger, 0.01);
        let input = json!({ "image": "x" });

        gateway
            .invoke("stability-ai/sdxl", &input, 0.008)
            .await
            .expect("first call fits");
        let err = gateway.invoke("stability-ai/sdxl", &input, 0.008).await;
        match err {
            Err(GatewayError::BudgetExceeded {
                operation,
                declared_cost,
                remaining,
            }) => {
                assert_eq!(operation, "stability-ai/sdxl");
                assert!((declared_cost - 0.008).abs() < 1e-9);
                assert!((remaining - 0.002).abs() < 1e-9);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn daily_report_tracks_spend() {
        let (_dir, ledger) = temp_ledger().await;
        let gateway = ProcessingGateway::new(Arc::new(CountingModel::ok()), ledger, 5.00);
        gateway
            .invoke("adirik/sam", &json!({ "image": "x" }), 0.002)
            .await
            .expect("invoke");

        let report = gateway.daily_report().await.expect("report");
        assert!((report.spent_usd - 0.002).abs() < 1e-9);
        assert!((report.budget_usd - 5.00).abs() < 1e-9);
        assert!((report.remaining_usd - 4.998).abs() < 1e-9);
    }
}
