//! Listing price search over a bundled market table.
//!
//! The deterministic counterpart of an external listings API: filters a
//! static table by region, property type, transaction type and price range,
//! and reports matches with per-listing prices in 만원.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use estate_engine::{
    PriceRange, Worker, WorkerContext, WorkerError, WorkerInput, WorkerOutput,
};

struct Listing {
    region: &'static str,
    complex: &'static str,
    property_type: &'static str,
    transaction_type: &'static str,
    /// 만원
    price: u64,
    area_m2: f64,
}

/// Curated sample of the market table the original service queries.
const LISTINGS: &[Listing] = &[
    Listing { region: "강남구", complex: "래미안대치팰리스", property_type: "apartment", transaction_type: "sale", price: 280_000, area_m2: 84.9 },
    Listing { region: "강남구", complex: "은마아파트", property_type: "apartment", transaction_type: "sale", price: 230_000, area_m2: 76.8 },
    Listing { region: "강남구", complex: "역삼푸르지오", property_type: "apartment", transaction_type: "jeonse", price: 95_000, area_m2: 59.9 },
    Listing { region: "서초구", complex: "반포자이", property_type: "apartment", transaction_type: "sale", price: 320_000, area_m2: 84.9 },
    Listing { region: "서초구", complex: "서초센트럴오피스텔", property_type: "officetel", transaction_type: "monthly_rent", price: 1_500, area_m2: 33.1 },
    Listing { region: "마포구", complex: "마포래미안푸르지오", property_type: "apartment", transaction_type: "jeonse", price: 78_000, area_m2: 84.6 },
    Listing { region: "마포구", complex: "공덕한화꿈에그린", property_type: "apartment", transaction_type: "sale", price: 145_000, area_m2: 59.8 },
    Listing { region: "송파구", complex: "헬리오시티", property_type: "apartment", transaction_type: "sale", price: 195_000, area_m2: 84.9 },
    Listing { region: "송파구", complex: "잠실리센츠", property_type: "apartment", transaction_type: "jeonse", price: 110_000, area_m2: 84.8 },
    Listing { region: "노원구", complex: "상계주공7단지", property_type: "apartment", transaction_type: "sale", price: 68_000, area_m2: 58.0 },
];

/// Market price lookup specialist.
#[derive(Debug, Default)]
pub struct PriceSearchWorker;

impl PriceSearchWorker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for PriceSearchWorker {
    fn name(&self) -> &str {
        "price_search"
    }

    fn priority(&self) -> u32 {
        90
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

        let params = &input.parameters;
        let region = params.get("region").and_then(Value::as_str);
        let property_type = params.get("property_type").and_then(Value::as_str);
        let transaction_type = params.get("transaction_type").and_then(Value::as_str);
        let price_range: Option<PriceRange> = params
            .get("price_range")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        let matches: Vec<&Listing> = LISTINGS
            .iter()
            .filter(|l| region.map_or(true, |r| l.region == r))
            .filter(|l| property_type.map_or(true, |p| l.property_type == p))
            .filter(|l| transaction_type.map_or(true, |t| l.transaction_type == t))
            .filter(|l| price_range.as_ref().map_or(true, |r| r.contains(l.price)))
            .collect();

        tracing::debug!(
            region = ?region,
            count = matches.len(),
            "price search completed"
        );

        if matches.is_empty() {
            return Ok(WorkerOutput::new(
                json!({
                    "summary": "조건에 맞는 매물을 찾지 못했습니다.",
                    "total_results": 0,
                    "listings": [],
                    "sources": ["국토교통부 실거래가 공개시스템"],
                }),
                0.4,
            ));
        }

        let total = matches.len();
        let mean_price = matches.iter().map(|l| l.price).sum::<u64>() / total as u64;
        let listings: Vec<Value> = matches
            .iter()
            .map(|l| {
                json!({
                    "region": l.region,
                    "complex": l.complex,
                    "property_type": l.property_type,
                    "transaction_type": l.transaction_type,
                    "price_manwon": l.price,
                    "area_m2": l.area_m2,
                })
            })
            .collect();

        Ok(WorkerOutput::new(
            json!({
                "summary": format!("검색 결과 {total}건, 평균 {mean_price}만원"),
                "total_results": total,
                "mean_price_manwon": mean_price,
                "listings": listings,
                "sources": [
                    "국토교통부 실거래가 공개시스템",
                    {"title": "KB부동산 시세", "url": "https://kbland.kr"},
                ],
            }),
            0.9,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_engine::ContextCarrier;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::watch;

    fn ctx() -> (watch::Sender<bool>, WorkerContext) {
        let (tx, rx) = watch::channel(false);
        let carrier: Arc<ContextCarrier> =
            ContextCarrier::for_testing("price").bind_run("t", "r", "q");
        (
            tx,
            WorkerContext::new(carrier, rx, Instant::now() + Duration::from_secs(5)),
        )
    }

    fn input(params: Value) -> WorkerInput {
        WorkerInput {
            query: "시세".to_string(),
            original_query: "시세".to_string(),
            parameters: params,
            collected_data: Default::default(),
            todos: Vec::new(),
        }
    }

    #[tokio::test]
    async fn filters_by_region_and_transaction() {
        let (_tx, ctx) = ctx();
        let out = PriceSearchWorker::new()
            .execute(
                &ctx,
                input(json!({"region": "강남구", "transaction_type": "jeonse"})),
            )
            .await
            .unwrap();

        assert_eq!(out.payload["total_results"], 1);
        assert_eq!(out.payload["listings"][0]["complex"], "역삼푸르지오");
        assert!((out.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn price_range_bounds_matches() {
        let (_tx, ctx) = ctx();
        let out = PriceSearchWorker::new()
            .execute(
                &ctx,
                input(json!({
                    "region": "강남구",
                    "transaction_type": "sale",
                    "price_range": {"min": null, "max": 250000}
                })),
            )
            .await
            .unwrap();

        assert_eq!(out.payload["total_results"], 1);
        assert_eq!(out.payload["listings"][0]["complex"], "은마아파트");
    }

    #[tokio::test]
    async fn no_match_reports_low_confidence() {
        let (_tx, ctx) = ctx();
        let out = PriceSearchWorker::new()
            .execute(&ctx, input(json!({"region": "제주시"})))
            .await
            .unwrap();

        assert_eq!(out.payload["total_results"], 0);
        assert!(out.confidence < 0.5);
        // sources still cited so the synthesizer can attribute the lookup
        assert!(out.payload["sources"].as_array().unwrap().len() == 1);
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let (tx, ctx) = ctx();
        tx.send(true).unwrap();
        let err = PriceSearchWorker::new()
            .execute(&ctx, input(json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
