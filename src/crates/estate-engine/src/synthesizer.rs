//! Final answer synthesis.
//!
//! Guidance responses (irrelevant or unclear intents) are composed from
//! configured texts and example prompts without touching the LLM. Real
//! answers prefer an LLM synthesis over the successful payloads and fall
//! back to a deterministic template that concatenates per-worker summaries.
//! Sources are collected from payloads carrying citation-like fields.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::types::{
    ExecutionPlan, IntentKind, IntentRecord, ResponseType, SourceRef, WorkerResult,
};
use estate_llm::{LlmClient, LlmParams, LlmRequest};

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a real-estate assistant. Combine the specialist \
findings into one helpful answer in the user's language. Reply with a JSON object \
{\"answer\": \"...\"}.";

/// The synthesizer's output, folded into the final payload by the engine.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub response_type: ResponseType,
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

/// Produces the user-visible answer from aggregated worker outputs.
pub struct Synthesizer {
    config: Arc<EngineConfig>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Synthesizer {
    pub fn new(config: Arc<EngineConfig>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Guidance for queries outside the domain, with example prompts.
    pub fn guidance_for_irrelevant(&self) -> Synthesis {
        Synthesis {
            response_type: ResponseType::Guidance,
            answer: self.with_examples(&self.config.guidance.irrelevant_message),
            sources: Vec::new(),
        }
    }

    /// Guidance asking for a more specific question.
    pub fn guidance_for_unclear(&self) -> Synthesis {
        Synthesis {
            response_type: ResponseType::Guidance,
            answer: self.with_examples(&self.config.guidance.unclear_message),
            sources: Vec::new(),
        }
    }

    fn with_examples(&self, message: &str) -> String {
        let examples = &self.config.guidance.example_prompts;
        if examples.is_empty() {
            return message.to_string();
        }
        let mut text = String::from(message);
        text.push_str("\n\nFor example:");
        for example in examples {
            text.push_str("\n- ");
            text.push_str(example);
        }
        text
    }

    /// Compose an answer from the successful worker results.
    pub async fn synthesize(
        &self,
        intent: &IntentRecord,
        plan: &ExecutionPlan,
        results: &BTreeMap<String, WorkerResult>,
        query: &str,
    ) -> Synthesis {
        match intent.kind {
            IntentKind::Irrelevant => return self.guidance_for_irrelevant(),
            IntentKind::Unclear => return self.guidance_for_unclear(),
            _ => {}
        }

        let mut successes: Vec<&WorkerResult> =
            results.values().filter(|r| r.is_success()).collect();
        // Present findings in plan order so the answer reads front-to-back.
        successes.sort_by_key(|r| {
            plan.steps
                .iter()
                .position(|s| s.worker_name == r.worker_name)
                .unwrap_or(usize::MAX)
        });

        if successes.is_empty() {
            return self.guidance_for_unclear();
        }

        let sources = collect_sources(&successes);

        if let Some(llm) = &self.llm {
            if let Some(answer) = self.synthesize_with_llm(llm.as_ref(), query, &successes).await {
                return Synthesis {
                    response_type: ResponseType::Answer,
                    answer,
                    sources,
                };
            }
            tracing::warn!("llm synthesis unavailable, using template fallback");
        }

        Synthesis {
            response_type: ResponseType::Answer,
            answer: template_answer(query, &successes),
            sources,
        }
    }

    async fn synthesize_with_llm(
        &self,
        llm: &dyn LlmClient,
        query: &str,
        successes: &[&WorkerResult],
    ) -> Option<String> {
        let findings: Vec<Value> = successes
            .iter()
            .map(|r| {
                json!({
                    "worker": r.worker_name,
                    "confidence": r.confidence,
                    "payload": r.payload,
                })
            })
            .collect();

        let params = LlmParams::for_purpose(&self.config.llm, "response");
        let request = LlmRequest::new(
            SYNTHESIS_SYSTEM_PROMPT,
            json!({"question": query, "findings": findings}).to_string(),
            params,
        )
        .with_schema(json!({
            "type": "object",
            "required": ["answer"],
            "properties": {"answer": {"type": "string"}}
        }));

        match llm.call(request).await {
            Ok(value) => value
                .get("answer")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
            Err(err) => {
                tracing::warn!(error = %err, "llm synthesis call failed");
                None
            }
        }
    }
}

/// Deterministic fallback: one line per worker summary.
fn template_answer(query: &str, successes: &[&WorkerResult]) -> String {
    let mut text = format!("Findings for \"{query}\":");
    for result in successes {
        let summary = result
            .payload
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| compact(&result.payload));
        text.push_str(&format!("\n- {}: {}", result.worker_name, summary));
    }
    text
}

fn compact(payload: &Value) -> String {
    let rendered = payload.to_string();
    if rendered.chars().count() > 200 {
        let truncated: String = rendered.chars().take(200).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}

/// Pull `sources` arrays out of payloads; entries may be plain strings or
/// `{title, url}` objects. Duplicates (by title) are dropped, order kept.
fn collect_sources(successes: &[&WorkerResult]) -> Vec<SourceRef> {
    let mut sources: Vec<SourceRef> = Vec::new();
    for result in successes {
        let Some(items) = result.payload.get("sources").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let source = match item {
                Value::String(title) => SourceRef::titled(title.clone()),
                Value::Object(map) => {
                    let Some(title) = map.get("title").and_then(Value::as_str) else {
                        continue;
                    };
                    SourceRef {
                        title: title.to_string(),
                        url: map.get("url").and_then(Value::as_str).map(str::to_string),
                    }
                }
                _ => continue,
            };
            if !sources.iter().any(|s| s.title == source.title) {
                sources.push(source);
            }
        }
    }
    sources
}
