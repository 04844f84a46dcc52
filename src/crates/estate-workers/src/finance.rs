//! Loan affordability analysis.
//!
//! Applies the standing LTV/DTI rules to a target price, preferring the
//! price-search payload from `collected_data` over the raw entity range so a
//! DAG consumer reasons about actual listings. Amounts are in 만원.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use estate_engine::{
    PriceRange, Worker, WorkerContext, WorkerError, WorkerInput, WorkerOutput,
};

/// Regulatory loan-to-value cap applied to the target price.
const LTV_RATIO: f64 = 0.7;
/// Jeonse deposit loans are capped at 80% of the deposit.
const JEONSE_RATIO: f64 = 0.8;
/// Reference annual interest rate (%), the original's default.
const BASE_RATE: f64 = 4.0;
const LOAN_TERM_YEARS: u32 = 30;

/// Financing specialist: loan caps and monthly payments.
#[derive(Debug, Default)]
pub struct FinanceWorker;

impl FinanceWorker {
    pub fn new() -> Self {
        Self
    }
}

/// Annuity payment per month for `principal` 만원 at `annual_rate`% over
/// `years`.
fn monthly_payment(principal: f64, annual_rate: f64, years: u32) -> f64 {
    let monthly_rate = annual_rate / 100.0 / 12.0;
    let months = (years * 12) as f64;
    if monthly_rate == 0.0 {
        return principal / months;
    }
    let factor = (1.0 + monthly_rate).powf(months);
    principal * monthly_rate * factor / (factor - 1.0)
}

#[async_trait]
impl Worker for FinanceWorker {
    fn name(&self) -> &str {
        "finance"
    }

    fn priority(&self) -> u32 {
        70
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn execute(
        &self,
        ctx: &WorkerContext,
        input: WorkerInput,
    ) -> Result<WorkerOutput, WorkerError> {
        if ctx.is_cancelled() {
            return Err(WorkerError::failed("cancelled"));
        }

        let transaction_type = input
            .parameters
            .get("transaction_type")
            .and_then(Value::as_str)
            .unwrap_or("sale");

        // Prefer observed market prices over the query's rough range.
        let target_price: Option<u64> = input
            .collected_data
            .get("price_search")
            .and_then(|p| p.get("mean_price_manwon"))
            .and_then(Value::as_u64)
            .or_else(|| {
                input
                    .parameters
                    .get("price_range")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<PriceRange>(v).ok())
                    .and_then(|r| r.max.or(r.min))
            });

        let Some(price) = target_price else {
            return Err(WorkerError::MissingParameter(
                "price_range or upstream price data".to_string(),
            ));
        };

        let ratio = if transaction_type == "jeonse" {
            JEONSE_RATIO
        } else {
            LTV_RATIO
        };
        let loan_cap = (price as f64 * ratio) as u64;
        let monthly = monthly_payment(loan_cap as f64, BASE_RATE, LOAN_TERM_YEARS);
        let own_funds = price.saturating_sub(loan_cap);

        tracing::debug!(price, loan_cap, "finance analysis completed");

        Ok(WorkerOutput::new(
            json!({
                "summary": format!(
                    "목표가 {price}만원 기준 대출 한도 {loan_cap}만원, 월 상환 약 {:.0}만원",
                    monthly
                ),
                "target_price_manwon": price,
                "loan_cap_manwon": loan_cap,
                "ltv_ratio": ratio,
                "interest_rate_pct": BASE_RATE,
                "term_years": LOAN_TERM_YEARS,
                "monthly_payment_manwon": monthly,
                "required_own_funds_manwon": own_funds,
                "sources": [
                    "금융감독원 주택담보대출 규제 안내",
                ],
            }),
            0.85,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_engine::ContextCarrier;
    use serde_json::Map;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::watch;

    fn ctx() -> WorkerContext {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let carrier: Arc<ContextCarrier> =
            ContextCarrier::for_testing("finance").bind_run("t", "r", "q");
        WorkerContext::new(carrier, rx, Instant::now() + Duration::from_secs(5))
    }

    #[tokio::test]
    async fn upstream_price_payload_wins_over_entities() {
        let mut collected = Map::new();
        collected.insert(
            "price_search".to_string(),
            json!({"mean_price_manwon": 100_000}),
        );

        let out = FinanceWorker::new()
            .execute(
                &ctx(),
                WorkerInput {
                    query: "대출".into(),
                    original_query: "대출".into(),
                    parameters: json!({"price_range": {"min": null, "max": 50_000}}),
                    collected_data: collected,
                    todos: Vec::new(),
                },
            )
            .await
            .unwrap();

        // 70% of the upstream mean, not of the entity range
        assert_eq!(out.payload["loan_cap_manwon"], 70_000);
        assert_eq!(out.payload["target_price_manwon"], 100_000);
    }

    #[tokio::test]
    async fn jeonse_uses_deposit_ratio() {
        let out = FinanceWorker::new()
            .execute(
                &ctx(),
                WorkerInput {
                    query: "전세 대출".into(),
                    original_query: "전세 대출".into(),
                    parameters: json!({
                        "transaction_type": "jeonse",
                        "price_range": {"min": 30_000, "max": 30_000}
                    }),
                    collected_data: Map::new(),
                    todos: Vec::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(out.payload["loan_cap_manwon"], 24_000);
        assert!((out.payload["ltv_ratio"].as_f64().unwrap() - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_price_information_is_a_worker_error() {
        let err = FinanceWorker::new()
            .execute(
                &ctx(),
                WorkerInput {
                    query: "대출".into(),
                    original_query: "대출".into(),
                    parameters: json!({}),
                    collected_data: Map::new(),
                    todos: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MissingParameter(_)));
    }

    #[test]
    fn annuity_formula_sane() {
        // 10_000만원 at 4% over 30y ≈ 47.7만원/month
        let monthly = monthly_payment(10_000.0, 4.0, 30);
        assert!((monthly - 47.74).abs() < 0.5);
        // zero rate degenerates to linear amortization
        assert!((monthly_payment(3_600.0, 0.0, 30) - 10.0).abs() < f64::EPSILON);
    }
}
