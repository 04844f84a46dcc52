//! Plan construction: intent → ordered or dependency-graphed worker steps.
//!
//! Selection is a declarative rule table mapping intent signals to candidate
//! workers with static priorities. The candidate set is capped, dependencies
//! are wired for the composite consultation case (finance consumes the price
//! search payload, legal consumes both), a strategy is chosen, and timeouts
//! are scaled: ×1.2 under Parallel for contention, proportionally compressed
//! under Sequential when the sum exceeds the run budget. An LLM may reorder
//! the candidates; the rule table is the mandatory deterministic path.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::registry::WorkerRegistry;
use crate::types::{
    Complexity, ExecutionPlan, IntentKind, IntentRecord, PlanStep, Strategy,
};
use estate_llm::{LlmClient, LlmParams, LlmRequest, ResponseFormat};

/// One row of the worker-selection rule table.
struct PlanRule {
    worker: &'static str,
    priority: u32,
    applies: fn(&IntentRecord) -> bool,
}

fn has_keyword(record: &IntentRecord, words: &[&str]) -> bool {
    record
        .keywords
        .iter()
        .any(|kw| words.contains(&kw.as_str()))
}

/// Deterministic selection table; order is the tie-break.
const RULES: &[PlanRule] = &[
    PlanRule {
        worker: "price_search",
        priority: 90,
        applies: |r| {
            r.kind == IntentKind::Search
                || r.entities.price_range.is_some()
                || r.entities.property_type.is_some()
                || has_keyword(r, &["시세", "가격", "매매가", "전세가", "price", "listing"])
        },
    },
    PlanRule {
        worker: "legal",
        priority: 80,
        applies: |r| {
            r.kind == IntentKind::Consultation
                || has_keyword(r, &["법", "계약", "검토", "권리", "legal", "contract", "law"])
        },
    },
    PlanRule {
        worker: "finance",
        priority: 70,
        applies: |r| {
            r.kind == IntentKind::Calculation
                || has_keyword(r, &["대출", "금리", "한도", "상환", "loan", "finance"])
        },
    },
    PlanRule {
        worker: "location",
        priority: 60,
        applies: |r| {
            r.entities.location.is_some()
                && (r.kind == IntentKind::Recommendation
                    || has_keyword(r, &["입지", "교통", "학군", "추천", "location", "transit"]))
        },
    },
];

const PLANNING_SYSTEM_PROMPT: &str = "You order real-estate specialist workers by usefulness \
for a question. Reply with a JSON object {\"workers\": [names, best first]} using only the \
provided names.";

/// Produces an [`ExecutionPlan`] from an intent and the available workers.
pub struct Planner {
    config: Arc<EngineConfig>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Planner {
    pub fn new(config: Arc<EngineConfig>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Build the plan. An empty candidate set yields an empty plan, which
    /// the engine answers with guidance rather than an error.
    pub async fn plan(
        &self,
        intent: &IntentRecord,
        registry: &WorkerRegistry,
    ) -> Result<ExecutionPlan> {
        let mut candidates: Vec<&PlanRule> = RULES
            .iter()
            .filter(|rule| (rule.applies)(intent))
            .filter(|rule| {
                let available = registry.is_available(rule.worker);
                if !available {
                    tracing::debug!(worker = rule.worker, "candidate not available, dropped");
                }
                available
            })
            .collect();

        // The original falls back to plain search when nothing matched a
        // searchable question.
        if candidates.is_empty()
            && intent.kind != IntentKind::Unclear
            && registry.is_available("price_search")
        {
            candidates.push(&RULES[0]);
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(ranked) = self.rank_with_llm(intent, &candidates).await {
            candidates.sort_by_key(|rule| {
                ranked
                    .iter()
                    .position(|name| name == rule.worker)
                    .unwrap_or(usize::MAX)
            });
        }

        candidates.truncate(self.config.run.max_workers_per_plan);

        let names: BTreeSet<&str> = candidates.iter().map(|r| r.worker).collect();
        let mut steps: Vec<PlanStep> = Vec::with_capacity(candidates.len());

        for (index, rule) in candidates.iter().enumerate() {
            let worker = registry.get(rule.worker)?;
            let step_id = format!("step-{}", index + 1);

            steps.push(PlanStep {
                step_id,
                worker_name: rule.worker.to_string(),
                parameters: step_parameters(rule.worker, intent),
                dependencies: BTreeSet::new(),
                timeout: worker.default_timeout().max(Duration::from_millis(1)),
                retry: worker.retry_policy(),
                priority: rule.priority,
                order: (index + 1) as u32,
            });
        }

        // Dependency wiring for the composite consultation shape: legal
        // consumes price and finance payloads, finance consumes price.
        if names.contains("legal") {
            let id_of = |worker: &str, steps: &[PlanStep]| -> Option<String> {
                steps
                    .iter()
                    .find(|s| s.worker_name == worker)
                    .map(|s| s.step_id.clone())
            };
            let price_id = id_of("price_search", &steps);
            let finance_id = id_of("finance", &steps);
            let legal_deps: BTreeSet<String> =
                price_id.iter().chain(finance_id.iter()).cloned().collect();

            for step in &mut steps {
                match step.worker_name.as_str() {
                    "finance" => {
                        if let Some(price) = &price_id {
                            step.dependencies.insert(price.clone());
                        }
                    }
                    "legal" => {
                        step.dependencies = legal_deps.clone();
                    }
                    _ => {}
                }
            }
        }

        let has_dependencies = steps.iter().any(|s| !s.dependencies.is_empty());
        let strategy = if steps.len() <= 1 || intent.complexity == Complexity::Simple {
            Strategy::Sequential
        } else if !has_dependencies && intent.complexity == Complexity::Complex {
            Strategy::Parallel
        } else {
            Strategy::Dag
        };

        let mut plan = ExecutionPlan { strategy, steps };
        self.scale_timeouts(&mut plan);

        if plan.strategy == Strategy::Sequential {
            // Sequential execution ignores edges; drop them so program order
            // is the only ordering.
            for step in &mut plan.steps {
                step.dependencies.clear();
            }
        }

        if let Err(err) = plan.validate() {
            // Planner-produced graphs should never cycle; degrade instead of
            // failing the run.
            tracing::warn!(error = %err, "plan validation failed, degrading to sequential");
            plan.strategy = Strategy::Sequential;
            for step in &mut plan.steps {
                step.dependencies.clear();
            }
            plan.validate()?;
        }

        tracing::info!(
            workers = ?plan.worker_names(),
            strategy = ?plan.strategy,
            "plan built"
        );
        Ok(plan)
    }

    /// Optional LLM ranking of candidate workers. Any failure falls back to
    /// the static priority order.
    async fn rank_with_llm(
        &self,
        intent: &IntentRecord,
        candidates: &[&PlanRule],
    ) -> Option<Vec<String>> {
        let llm = self.llm.as_ref()?;
        if candidates.len() < 2 {
            return None;
        }

        let names: Vec<&str> = candidates.iter().map(|r| r.worker).collect();
        let params = LlmParams::for_purpose(&self.config.llm, "planning")
            .with_format(ResponseFormat::Json);
        let request = LlmRequest::new(
            PLANNING_SYSTEM_PROMPT,
            format!(
                "intent: {}, keywords: {:?}, workers: {:?}",
                intent.kind, intent.keywords, names
            ),
            params,
        );

        let value = match llm.call(request).await {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "llm planner unavailable, using rule order");
                return None;
            }
        };

        let ranked: Vec<String> = value
            .get("workers")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| names.contains(name))
            .map(str::to_string)
            .collect();

        if ranked.is_empty() {
            None
        } else {
            Some(ranked)
        }
    }

    /// Apply the strategy-dependent timeout rules.
    fn scale_timeouts(&self, plan: &mut ExecutionPlan) {
        match plan.strategy {
            Strategy::Parallel => {
                for step in &mut plan.steps {
                    step.timeout = step.timeout.mul_f64(1.2);
                }
            }
            Strategy::Sequential => {
                let total: Duration = plan.steps.iter().map(|s| s.timeout).sum();
                let budget = self.config.run.total_run_timeout;
                if total > budget && !total.is_zero() {
                    let factor = budget.as_secs_f64() / total.as_secs_f64();
                    for step in &mut plan.steps {
                        step.timeout = step.timeout.mul_f64(factor);
                    }
                }
            }
            Strategy::Dag => {}
        }
    }
}

/// Per-worker parameters derived from the extracted entities.
fn step_parameters(worker: &str, intent: &IntentRecord) -> Value {
    let entities = &intent.entities;
    match worker {
        "price_search" => json!({
            "region": entities.location,
            "property_type": entities.property_type,
            "transaction_type": entities.transaction_type,
            "price_range": entities.price_range,
            "size_range": entities.size_range,
        }),
        "finance" => json!({
            "price_range": entities.price_range,
            "transaction_type": entities.transaction_type,
        }),
        "location" => json!({
            "region": entities.location,
        }),
        "legal" => json!({
            "transaction_type": entities.transaction_type,
            "property_type": entities.property_type,
            "region": entities.location,
            "price_range": entities.price_range,
            "size_range": entities.size_range,
        }),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entities;
    use crate::worker::{Worker, WorkerContext, WorkerError, WorkerInput, WorkerOutput};
    use async_trait::async_trait;

    struct StubWorker {
        name: &'static str,
        timeout: Duration,
    }

    #[async_trait]
    impl Worker for StubWorker {
        fn name(&self) -> &str {
            self.name
        }

        fn default_timeout(&self) -> Duration {
            self.timeout
        }

        async fn execute(
            &self,
            _ctx: &WorkerContext,
            _input: WorkerInput,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            Ok(WorkerOutput::new(json!({}), 1.0))
        }
    }

    fn full_registry() -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        for name in ["price_search", "finance", "legal", "location"] {
            registry.register(Arc::new(StubWorker {
                name,
                timeout: Duration::from_secs(10),
            }));
        }
        registry
    }

    fn planner() -> Planner {
        Planner::new(Arc::new(EngineConfig::default()), None)
    }

    fn intent(kind: IntentKind, keywords: &[&str], complexity: Complexity) -> IntentRecord {
        IntentRecord {
            kind,
            entities: Entities::default(),
            confidence: 0.8,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            reasoning: String::new(),
            complexity,
        }
    }

    #[tokio::test]
    async fn single_candidate_is_sequential() {
        let plan = planner()
            .plan(
                &intent(IntentKind::Search, &["시세"], Complexity::Simple),
                &full_registry(),
            )
            .await
            .unwrap();

        assert_eq!(plan.strategy, Strategy::Sequential);
        assert_eq!(plan.worker_names(), vec!["price_search"]);
        assert!(plan.steps[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn price_and_finance_without_legal_run_parallel() {
        let plan = planner()
            .plan(
                &intent(IntentKind::Search, &["시세", "대출"], Complexity::Complex),
                &full_registry(),
            )
            .await
            .unwrap();

        assert_eq!(plan.strategy, Strategy::Parallel);
        let names: BTreeSet<&str> = plan.worker_names().into_iter().collect();
        assert_eq!(names, BTreeSet::from(["price_search", "finance"]));
        assert!(plan.steps.iter().all(|s| s.dependencies.is_empty()));
        // parallel contention scaling
        assert_eq!(plan.steps[0].timeout, Duration::from_secs(12));
    }

    #[tokio::test]
    async fn legal_composite_builds_a_dag() {
        let plan = planner()
            .plan(
                &intent(
                    IntentKind::Consultation,
                    &["시세", "대출", "계약"],
                    Complexity::Complex,
                ),
                &full_registry(),
            )
            .await
            .unwrap();

        assert_eq!(plan.strategy, Strategy::Dag);
        let price = plan
            .steps
            .iter()
            .find(|s| s.worker_name == "price_search")
            .unwrap();
        let finance = plan.steps.iter().find(|s| s.worker_name == "finance").unwrap();
        let legal = plan.steps.iter().find(|s| s.worker_name == "legal").unwrap();

        assert!(price.dependencies.is_empty());
        assert_eq!(
            finance.dependencies,
            BTreeSet::from([price.step_id.clone()])
        );
        assert_eq!(
            legal.dependencies,
            BTreeSet::from([price.step_id.clone(), finance.step_id.clone()])
        );
        plan.validate().unwrap();
    }

    #[tokio::test]
    async fn candidate_cap_preserves_priority_order() {
        let mut config = EngineConfig::default();
        config.run.max_workers_per_plan = 2;
        let planner = Planner::new(Arc::new(config), None);

        let mut record = intent(
            IntentKind::Consultation,
            &["시세", "대출", "계약", "추천"],
            Complexity::Complex,
        );
        record.entities.location = Some("강남구".to_string());

        let plan = planner.plan(&record, &full_registry()).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        // price_search (90) and legal (80) outrank finance and location
        assert_eq!(plan.worker_names(), vec!["price_search", "legal"]);
    }

    #[tokio::test]
    async fn unavailable_workers_are_dropped() {
        let registry = full_registry();
        registry.set_enabled("finance", false);

        let plan = planner()
            .plan(
                &intent(IntentKind::Search, &["시세", "대출"], Complexity::Complex),
                &registry,
            )
            .await
            .unwrap();
        assert_eq!(plan.worker_names(), vec!["price_search"]);
    }

    #[tokio::test]
    async fn empty_registry_yields_empty_plan() {
        let registry = WorkerRegistry::new();
        let plan = planner()
            .plan(&intent(IntentKind::Search, &["시세"], Complexity::Simple), &registry)
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn searchless_intent_defaults_to_price_search() {
        let plan = planner()
            .plan(
                // recommendation with no matching keywords still gets the
                // default search step
                &intent(IntentKind::Recommendation, &[], Complexity::Simple),
                &full_registry(),
            )
            .await
            .unwrap();
        assert_eq!(plan.worker_names(), vec!["price_search"]);
    }

    #[tokio::test]
    async fn sequential_timeouts_compress_to_budget() {
        let mut config = EngineConfig::default();
        config.run.total_run_timeout = Duration::from_secs(10);
        let planner = Planner::new(Arc::new(config), None);

        let registry = WorkerRegistry::new();
        registry.register(Arc::new(StubWorker {
            name: "price_search",
            timeout: Duration::from_secs(8),
        }));
        registry.register(Arc::new(StubWorker {
            name: "finance",
            timeout: Duration::from_secs(12),
        }));

        // moderate complexity with two workers and no legal: DAG would be
        // chosen for complex; force simple → sequential
        let plan = planner
            .plan(
                &intent(IntentKind::Search, &["시세", "대출"], Complexity::Simple),
                &registry,
            )
            .await
            .unwrap();

        assert_eq!(plan.strategy, Strategy::Sequential);
        let total: Duration = plan.steps.iter().map(|s| s.timeout).sum();
        assert!(total <= Duration::from_secs(10) + Duration::from_millis(5));
    }

    #[tokio::test]
    async fn llm_ranking_reorders_candidates() {
        use estate_llm::ScriptedLlmClient;
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::always(json!({
            "workers": ["finance", "price_search"]
        })));
        let planner = Planner::new(Arc::new(EngineConfig::default()), Some(llm));

        let plan = planner
            .plan(
                &intent(IntentKind::Search, &["시세", "대출"], Complexity::Complex),
                &full_registry(),
            )
            .await
            .unwrap();
        assert_eq!(plan.worker_names(), vec!["finance", "price_search"]);
    }
}
