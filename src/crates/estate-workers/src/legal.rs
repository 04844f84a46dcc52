//! Contract and tenancy guidance from a rule table.
//!
//! Checklist-style legal guidance keyed by transaction type, citing the
//! statutes the advice derives from. Sale transactions additionally get an
//! acquisition-tax breakdown (price-tier base rate, first-home and
//! regulated-area adjustments, education and rural surtaxes, reductions).
//! Reads the price-search and finance payloads when a DAG wired them
//! upstream: observed prices feed the tax base, and loan caps above the
//! LTV line add a repayment warning.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use estate_engine::{
    PriceRange, SizeRange, Worker, WorkerContext, WorkerError, WorkerInput, WorkerOutput,
};

const JEONSE_CHECKLIST: &[&str] = &[
    "등기부등본에서 선순위 근저당과 가압류를 확인하세요.",
    "전입신고와 확정일자를 잔금일에 바로 갖추어 대항력을 확보하세요.",
    "보증금이 주택가격 대비 과도하면 전세보증금 반환보증 가입을 검토하세요.",
    "임대인의 국세·지방세 완납 여부를 계약 전에 확인할 수 있습니다.",
];

const SALE_CHECKLIST: &[&str] = &[
    "등기부등본의 소유자와 매도인이 일치하는지 확인하세요.",
    "계약금·중도금·잔금 일정과 위약 조항을 서면으로 명시하세요.",
    "자금조달계획서 제출 대상 여부를 확인하세요.",
];

const RENT_CHECKLIST: &[&str] = &[
    "보증금과 월세의 전월세전환율이 법정 상한 이내인지 확인하세요.",
    "계약갱신요구권 행사 가능 기간을 확인하세요.",
];

/// Areas under purchase regulation; a location naming one of these gets the
/// regulated acquisition-tax rates.
const REGULATED_AREAS: &[&str] = &[
    "서울", "과천", "성남", "하남", "고양", "남양주", "화성", "세종",
];

/// Price tiers for the base acquisition-tax rate, in 만원.
const TIER_ONE_MANWON: u64 = 60_000; // 6억
const TIER_TWO_MANWON: u64 = 90_000; // 9억

/// Floor area under which the first-home reduction applies, in ㎡.
const FIRST_HOME_REDUCTION_AREA_M2: f64 = 60.0;

/// Default exclusive floor area when the query named none.
const DEFAULT_AREA_M2: f64 = 85.0;

/// Acquisition-tax breakdown for a sale at `price` 만원.
///
/// Base rate by price tier: 1% up to 6억, 2% (3% in a regulated area) up to
/// 9억, 3% above; a non-first-home purchase above 9억 is surcharged to 8%.
/// Education tax is 10% of the acquisition tax; the rural special tax is
/// 20% once the base rate reaches 2%. A first home at or under 6억 and
/// 60㎡ halves the acquisition tax.
fn acquisition_tax(
    price: u64,
    area_m2: f64,
    is_first_home: bool,
    region: Option<&str>,
) -> Value {
    let is_regulated = region
        .map(|r| REGULATED_AREAS.iter().any(|area| r.contains(area)))
        .unwrap_or(false);

    let mut base_rate = if price <= TIER_ONE_MANWON {
        0.01
    } else if price <= TIER_TWO_MANWON {
        if is_regulated {
            0.03
        } else {
            0.02
        }
    } else {
        0.03
    };
    if !is_first_home && price > TIER_TWO_MANWON {
        base_rate = 0.08;
    }

    let acquisition = price as f64 * base_rate;
    let education = acquisition * 0.1;
    let rural = if base_rate >= 0.02 { acquisition * 0.2 } else { 0.0 };
    let total = acquisition + education + rural;

    let mut reduction = 0.0;
    let mut reduction_reasons: Vec<&str> = Vec::new();
    if is_first_home {
        if price <= TIER_ONE_MANWON && area_m2 <= FIRST_HOME_REDUCTION_AREA_M2 {
            reduction = acquisition * 0.5;
            reduction_reasons.push("생애첫주택 구매 (50% 감면)");
        } else if price <= TIER_TWO_MANWON {
            reduction_reasons.push("생애첫주택 구매 (감면 혜택 확인 필요)");
        }
    }

    json!({
        "price_manwon": price,
        "area_m2": area_m2,
        "is_first_home": is_first_home,
        "is_regulated_area": is_regulated,
        "base_rate_pct": base_rate * 100.0,
        "acquisition_tax_manwon": acquisition as u64,
        "education_tax_manwon": education as u64,
        "rural_tax_manwon": rural as u64,
        "total_tax_manwon": total as u64,
        "reduction_manwon": reduction as u64,
        "final_tax_manwon": (total - reduction) as u64,
        "reduction_reasons": reduction_reasons,
        "payment_due": "취득일로부터 60일 이내",
    })
}

/// Legal review specialist.
#[derive(Debug, Default)]
pub struct LegalWorker;

impl LegalWorker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for LegalWorker {
    fn name(&self) -> &str {
        "legal"
    }

    fn priority(&self) -> u32 {
        80
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(12)
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
        let transaction_type = params
            .get("transaction_type")
            .and_then(Value::as_str)
            .unwrap_or("sale");

        let (checklist, statute) = match transaction_type {
            "jeonse" => (JEONSE_CHECKLIST, "주택임대차보호법"),
            "monthly_rent" => (RENT_CHECKLIST, "주택임대차보호법"),
            _ => (SALE_CHECKLIST, "부동산 거래신고 등에 관한 법률"),
        };

        let mut items: Vec<String> = checklist.iter().map(|s| s.to_string()).collect();

        // Upstream finance data lets the review flag over-leveraged deposits.
        if let Some(finance) = input.collected_data.get("finance") {
            if let (Some(cap), Some(price)) = (
                finance.get("loan_cap_manwon").and_then(Value::as_u64),
                finance.get("target_price_manwon").and_then(Value::as_u64),
            ) {
                if cap * 10 > price * 7 {
                    items.push(format!(
                        "대출 한도 {cap}만원이 목표가의 70%를 넘어 상환 계획 점검이 필요합니다."
                    ));
                }
            }
        }

        // A sale review includes the acquisition-tax breakdown when a price
        // is known; observed market prices beat the query's rough range.
        let mut tax: Option<Value> = None;
        if transaction_type == "sale" {
            let price: Option<u64> = input
                .collected_data
                .get("price_search")
                .and_then(|p| p.get("mean_price_manwon"))
                .and_then(Value::as_u64)
                .or_else(|| {
                    params
                        .get("price_range")
                        .cloned()
                        .and_then(|v| serde_json::from_value::<PriceRange>(v).ok())
                        .and_then(|r| r.max.or(r.min))
                });

            if let Some(price) = price {
                let area_m2 = params
                    .get("size_range")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<SizeRange>(v).ok())
                    .and_then(|r| r.min_m2)
                    .unwrap_or(DEFAULT_AREA_M2);
                let is_first_home = params
                    .get("is_first_home")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let region = params.get("region").and_then(Value::as_str);

                tax = Some(acquisition_tax(price, area_m2, is_first_home, region));
            }
        }

        tracing::debug!(
            transaction_type,
            items = items.len(),
            tax = tax.is_some(),
            "legal review completed"
        );

        let summary = match &tax {
            Some(tax) => format!(
                "{transaction_type} 계약 유의사항 {}건, 취득세 총 {}만원",
                items.len(),
                tax["final_tax_manwon"]
            ),
            None => format!("{transaction_type} 계약 유의사항 {}건", items.len()),
        };

        Ok(WorkerOutput::new(
            json!({
                "summary": summary,
                "transaction_type": transaction_type,
                "checklist": items,
                "acquisition_tax": tax,
                "sources": [
                    {"title": statute, "url": "https://law.go.kr"},
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
            ContextCarrier::for_testing("legal").bind_run("t", "r", "q");
        WorkerContext::new(carrier, rx, Instant::now() + Duration::from_secs(5))
    }

    fn input(params: Value, collected: Map<String, Value>) -> WorkerInput {
        WorkerInput {
            query: "계약 검토".into(),
            original_query: "계약 검토".into(),
            parameters: params,
            collected_data: collected,
            todos: Vec::new(),
        }
    }

    #[tokio::test]
    async fn jeonse_checklist_cites_tenancy_act_without_tax() {
        let out = LegalWorker::new()
            .execute(
                &ctx(),
                input(json!({"transaction_type": "jeonse"}), Map::new()),
            )
            .await
            .unwrap();

        assert_eq!(out.payload["checklist"].as_array().unwrap().len(), 4);
        assert_eq!(out.payload["sources"][0]["title"], "주택임대차보호법");
        assert!(out.payload["acquisition_tax"].is_null());
    }

    #[tokio::test]
    async fn first_home_small_flat_gets_the_reduced_rate() {
        // 5억, 59.9㎡, first home: 1% base, no rural surtax, 50% reduction
        let out = LegalWorker::new()
            .execute(
                &ctx(),
                input(
                    json!({
                        "transaction_type": "sale",
                        "price_range": {"min": 50_000, "max": 50_000},
                        "size_range": {"min_m2": 59.9, "max_m2": 59.9},
                    }),
                    Map::new(),
                ),
            )
            .await
            .unwrap();

        let tax = &out.payload["acquisition_tax"];
        assert_eq!(tax["base_rate_pct"], 1.0);
        assert_eq!(tax["acquisition_tax_manwon"], 500);
        assert_eq!(tax["education_tax_manwon"], 50);
        assert_eq!(tax["rural_tax_manwon"], 0);
        assert_eq!(tax["total_tax_manwon"], 550);
        assert_eq!(tax["reduction_manwon"], 250);
        assert_eq!(tax["final_tax_manwon"], 300);
        assert_eq!(tax["reduction_reasons"][0], "생애첫주택 구매 (50% 감면)");
        assert!(out.payload["summary"].as_str().unwrap().contains("300만원"));
    }

    #[tokio::test]
    async fn regulated_area_mid_tier_uses_three_percent_with_surtaxes() {
        // 8억 in a regulated area: 3% base, education 10%, rural 20%
        let out = LegalWorker::new()
            .execute(
                &ctx(),
                input(
                    json!({
                        "transaction_type": "sale",
                        "region": "서울 마포구",
                        "price_range": {"min": null, "max": 80_000},
                    }),
                    Map::new(),
                ),
            )
            .await
            .unwrap();

        let tax = &out.payload["acquisition_tax"];
        assert_eq!(tax["is_regulated_area"], true);
        assert_eq!(tax["base_rate_pct"], 3.0);
        assert_eq!(tax["acquisition_tax_manwon"], 2_400);
        assert_eq!(tax["education_tax_manwon"], 240);
        assert_eq!(tax["rural_tax_manwon"], 480);
        assert_eq!(tax["total_tax_manwon"], 3_120);
        assert_eq!(tax["reduction_manwon"], 0);
        assert_eq!(tax["final_tax_manwon"], 3_120);
    }

    #[tokio::test]
    async fn upstream_price_feeds_the_tax_base_and_second_homes_are_surcharged() {
        let mut collected = Map::new();
        collected.insert(
            "price_search".to_string(),
            json!({"mean_price_manwon": 100_000}),
        );

        let out = LegalWorker::new()
            .execute(
                &ctx(),
                input(
                    json!({
                        "transaction_type": "sale",
                        "is_first_home": false,
                        "price_range": {"min": null, "max": 30_000},
                    }),
                    collected,
                ),
            )
            .await
            .unwrap();

        // the observed 10억 mean wins over the 3억 entity range; above 9억
        // and not a first home → 8%
        let tax = &out.payload["acquisition_tax"];
        assert_eq!(tax["price_manwon"], 100_000);
        assert_eq!(tax["base_rate_pct"], 8.0);
        assert_eq!(tax["acquisition_tax_manwon"], 8_000);
        assert_eq!(tax["total_tax_manwon"], 10_400);
    }

    #[tokio::test]
    async fn sale_without_any_price_skips_the_tax_section() {
        let out = LegalWorker::new()
            .execute(&ctx(), input(json!({"transaction_type": "sale"}), Map::new()))
            .await
            .unwrap();

        assert!(out.payload["acquisition_tax"].is_null());
        assert_eq!(out.payload["checklist"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn over_leveraged_finance_data_adds_a_warning() {
        let mut collected = Map::new();
        collected.insert(
            "finance".to_string(),
            json!({"loan_cap_manwon": 24_000, "target_price_manwon": 30_000}),
        );

        let out = LegalWorker::new()
            .execute(
                &ctx(),
                input(json!({"transaction_type": "jeonse"}), collected),
            )
            .await
            .unwrap();

        let checklist = out.payload["checklist"].as_array().unwrap();
        assert_eq!(checklist.len(), 5);
        assert!(checklist[4].as_str().unwrap().contains("상환 계획"));
    }

    #[tokio::test]
    async fn unknown_transaction_defaults_to_sale_rules() {
        let out = LegalWorker::new()
            .execute(&ctx(), input(json!({}), Map::new()))
            .await
            .unwrap();
        assert_eq!(out.payload["transaction_type"], "sale");
    }
}
