//! Query analysis: intent classification and entity extraction.
//!
//! The analyzer asks the LLM first with a schema-constrained prompt. When no
//! client is configured, the call fails, or the reply does not parse, it
//! falls back to deterministic keyword classification over per-kind
//! vocabularies: confidence is `matched_tokens / vocabulary_size`, ties go
//! to the earlier kind, and an all-zero score yields `unclear`. Entities are
//! always extracted by regular-expression rules over the fixed set
//! (location, price with 억/천만/만 suffix normalization, area in 평 or ㎡,
//! transaction and property types).

use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};

use crate::config::EngineConfig;
use crate::context::ContextCarrier;
use crate::types::{Complexity, Entities, IntentKind, IntentRecord, PriceRange, SizeRange};
use estate_llm::{LlmClient, LlmParams, LlmRequest};

static LOCATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([가-힣]+(?:특별시|광역시|시|구|군|동|읍|면))").unwrap());

static PRICE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(억|천만|만)(?:\s*원)?").unwrap());

static AREA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(평|㎡|m2)").unwrap());

/// Keyword vocabulary for one intent kind. Order matters: earlier kinds win
/// score ties.
const VOCABULARIES: &[(IntentKind, &[&str])] = &[
    (
        IntentKind::Search,
        &[
            "시세", "가격", "매매가", "전세가", "동향", "얼마", "price", "lookup", "search",
            "listing",
        ],
    ),
    (
        IntentKind::Calculation,
        &[
            "계산", "대출", "금리", "한도", "상환", "세금", "calculate", "loan", "finance",
            "compare",
        ],
    ),
    (
        IntentKind::Recommendation,
        &["추천", "좋은", "베스트", "recommend", "best", "suggest"],
    ),
    (
        IntentKind::Consultation,
        &[
            "법", "계약", "보증금", "임대", "검토", "권리", "legal", "contract", "law", "review",
        ],
    ),
];

const INTENT_SYSTEM_PROMPT: &str = "You classify real-estate questions. \
Reply with a JSON object: {\"kind\": one of search|calculation|recommendation|consultation|unclear|irrelevant, \
\"confidence\": 0.0-1.0, \"keywords\": [salient tokens], \"reasoning\": short text}. \
Use \"irrelevant\" for questions outside the real-estate domain.";

/// Classifies intent, extracts entities and scores complexity.
pub struct Analyzer {
    config: Arc<EngineConfig>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Analyzer {
    pub fn new(config: Arc<EngineConfig>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Produce an [`IntentRecord`] for a query. Never fails: analyzer
    /// problems are encoded in the record's kind.
    pub async fn analyze(&self, query: &str, carrier: &ContextCarrier) -> IntentRecord {
        let query = query.trim();
        if query.is_empty() {
            return IntentRecord::unclear();
        }

        // A configured-but-missing credential is a configuration problem,
        // not a transient outage; it surfaces as an error record.
        if self.llm.is_some() {
            if let Some(required) = &self.config.llm.credential {
                if !carrier.has_credential(required) {
                    tracing::error!(credential = %required, "llm credential not available");
                    return IntentRecord {
                        kind: IntentKind::Error,
                        reasoning: format!("credential '{required}' not available"),
                        ..IntentRecord::unclear()
                    };
                }
            }
        }

        let entities = self.extract_entities(query);

        if let Some(llm) = &self.llm {
            match self.analyze_with_llm(llm.as_ref(), query).await {
                Some(mut record) => {
                    record.entities = entities;
                    record.complexity = self.score_complexity(&record);
                    return record;
                }
                None => {
                    tracing::warn!("llm intent analysis unavailable, using keyword fallback");
                }
            }
        }

        let mut record = self.classify_by_keywords(query);
        record.entities = entities;
        record.complexity = self.score_complexity(&record);
        record
    }

    async fn analyze_with_llm(&self, llm: &dyn LlmClient, query: &str) -> Option<IntentRecord> {
        let params = LlmParams::for_purpose(&self.config.llm, "intent");
        let request = LlmRequest::new(
            INTENT_SYSTEM_PROMPT,
            format!("Classify this question: {query}"),
            params,
        )
        .with_schema(json!({
            "type": "object",
            "required": ["kind", "confidence"],
            "properties": {
                "kind": {"type": "string"},
                "confidence": {"type": "number"},
                "keywords": {"type": "array", "items": {"type": "string"}},
                "reasoning": {"type": "string"}
            }
        }));

        let value = match llm.call(request).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "llm intent call failed");
                return None;
            }
        };

        let kind = match value.get("kind").and_then(Value::as_str) {
            Some("search") => IntentKind::Search,
            Some("calculation") => IntentKind::Calculation,
            Some("recommendation") => IntentKind::Recommendation,
            Some("consultation") => IntentKind::Consultation,
            Some("unclear") => IntentKind::Unclear,
            Some("irrelevant") => IntentKind::Irrelevant,
            other => {
                tracing::warn!(kind = ?other, "llm returned unknown intent kind");
                return None;
            }
        };

        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let keywords = value
            .get("keywords")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(IntentRecord {
            kind,
            entities: Entities::default(),
            confidence,
            keywords,
            reasoning,
            complexity: Complexity::Simple,
        })
    }

    /// Deterministic fallback: keyword matching over curated vocabularies.
    fn classify_by_keywords(&self, query: &str) -> IntentRecord {
        let lowered = query.to_lowercase();

        let mut best_kind = IntentKind::Unclear;
        let mut best_confidence = 0.0_f64;
        let mut keywords: Vec<String> = Vec::new();

        for (kind, vocabulary) in VOCABULARIES {
            let matched: Vec<&str> = vocabulary
                .iter()
                .copied()
                .filter(|kw| lowered.contains(kw))
                .collect();
            if matched.is_empty() {
                continue;
            }

            for kw in &matched {
                if !keywords.iter().any(|k| k == kw) {
                    keywords.push((*kw).to_string());
                }
            }

            let confidence = (matched.len() as f64 / vocabulary.len() as f64).min(1.0);
            if confidence > best_confidence {
                best_confidence = confidence;
                best_kind = *kind;
            }
        }

        if best_confidence < self.config.intent.min_confidence_threshold {
            return IntentRecord {
                keywords,
                reasoning: "keyword fallback: no kind above threshold".to_string(),
                ..IntentRecord::unclear()
            };
        }

        IntentRecord {
            kind: best_kind,
            entities: Entities::default(),
            confidence: best_confidence,
            keywords,
            reasoning: "keyword fallback".to_string(),
            complexity: Complexity::Simple,
        }
    }

    fn extract_entities(&self, query: &str) -> Entities {
        let mut entities = Entities::default();

        if let Some(caps) = LOCATION_REGEX.captures(query) {
            entities.location = Some(caps[1].to_string());
        }

        if let Some(caps) = PRICE_REGEX.captures(query) {
            let amount: f64 = caps[1].parse().unwrap_or(0.0);
            // Normalized to 만원.
            let manwon = match &caps[2] {
                "억" => amount * 10_000.0,
                "천만" => amount * 1_000.0,
                _ => amount,
            } as u64;

            let match_end = caps.get(0).map(|m| m.end()).unwrap_or(query.len());
            let qualifier = query[match_end..].trim_start();
            entities.price_range = Some(
                if qualifier.starts_with("이하")
                    || qualifier.starts_with("이내")
                    || qualifier.starts_with("미만")
                {
                    PriceRange::at_most(manwon)
                } else if qualifier.starts_with("이상") {
                    PriceRange::at_least(manwon)
                } else {
                    PriceRange::around(manwon)
                },
            );
        }

        if let Some(caps) = AREA_REGEX.captures(query) {
            let amount: f64 = caps[1].parse().unwrap_or(0.0);
            let m2 = if &caps[2] == "평" {
                amount * 3.305_785
            } else {
                amount
            };
            entities.size_range = Some(SizeRange {
                min_m2: Some(m2),
                max_m2: Some(m2),
            });
        }

        for (marker, tag) in [("월세", "monthly_rent"), ("전세", "jeonse"), ("매매", "sale")] {
            if query.contains(marker) {
                entities.transaction_type = Some(tag.to_string());
                break;
            }
        }

        let lowered = query.to_lowercase();
        for (marker, tag) in [
            ("아파트", "apartment"),
            ("apartment", "apartment"),
            ("오피스텔", "officetel"),
            ("빌라", "villa"),
            ("원룸", "studio"),
        ] {
            if lowered.contains(marker) {
                entities.property_type = Some(tag.to_string());
                break;
            }
        }

        entities
    }

    fn score_complexity(&self, record: &IntentRecord) -> Complexity {
        let kind_signals = VOCABULARIES
            .iter()
            .filter(|(_, vocabulary)| {
                record
                    .keywords
                    .iter()
                    .any(|kw| vocabulary.contains(&kw.as_str()))
            })
            .count();

        if kind_signals >= 2 {
            Complexity::Complex
        } else if record.entities.count() >= 2 {
            Complexity::Moderate
        } else {
            Complexity::Simple
        }
    }
}
