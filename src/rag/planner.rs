//! LLM-driven query planner: turns a natural-language question into a
//! structured intent + parameters, validated against an allow-list before
//! anything downstream trusts it.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::security::{sanitize_for_prompt, validate_llm_json_output};

pub const ALLOWED_INTENTS: &[&str] =
    &["find_connections", "find_mitigating_controls", "get_attributes", "semantic_search"];

pub const QUERY_PLANNER_PROMPT: &str = r#"You are an expert knowledge graph query planner. Your task is to decompose a user's natural language question into a structured JSON command.

The graph has:
- Entity nodes with properties: id, name, type (e.g., type="Risk", type="Control", type="Person")
- Relationship types: MITIGATES, AFFECTS, WORKS_FOR, MENTIONS, etc.
- Chunk nodes containing source text
- Document nodes

Select one of the following intents:
- `semantic_search`: For general questions that need semantic similarity. Best for most queries.
- `find_connections`: For questions about how specific named entities are related.
- `find_mitigating_controls`: For questions about what controls mitigate risks.
- `get_attributes`: For questions asking for details about a specific named entity.

Extract relevant parameters:
- For semantic_search: optional entity_type filter
- For find_connections: list of entity names
- For find_mitigating_controls: risk category/name
- For get_attributes: entity name

Example 1:
Question: "Tell me about financial risks"
JSON:
{
  "intent": "semantic_search",
  "parameters": {
    "entity_type": "Risk"
  }
}

Example 2:
Question: "What are the connections between 'Insider Trading' and 'John Doe'?"
JSON:
{
  "intent": "find_connections",
  "parameters": {
    "entity_names": ["Insider Trading", "John Doe"]
  }
}

Example 3:
Question: "What controls mitigate fraud risk?"
JSON:
{
  "intent": "find_mitigating_controls",
  "parameters": {
    "risk_name": "fraud"
  }
}

Respond ONLY with the JSON object. No explanations."#;

/// A validated query plan: a known intent plus its (also validated, but
/// otherwise un-typed) parameter object. Downstream graph-intent dispatch
/// pulls specific keys back out (`entity_names`, `risk_name`, ...).
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub intent: String,
    pub parameters: Value,
}

impl QueryPlan {
    pub fn fallback() -> Self {
        Self { intent: "semantic_search".to_string(), parameters: Value::Object(Default::default()) }
    }

    pub fn string_param(&self, key: &str) -> Option<String> {
        self.parameters.get(key).and_then(Value::as_str).map(str::to_string)
    }

    pub fn string_array_param(&self, key: &str) -> Vec<String> {
        self.parameters
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait QueryPlanProvider: Send + Sync {
    async fn complete_plan_json(&self, system_prompt: &str, user_query: &str) -> EngineResult<String>;
}

pub struct RigQueryPlanProvider {
    model: String,
}

impl RigQueryPlanProvider {
    pub fn from_config(cfg: &crate::config::EngineConfig) -> Self {
        Self { model: cfg.extraction_model.clone() }
    }
}

#[async_trait]
impl QueryPlanProvider for RigQueryPlanProvider {
    async fn complete_plan_json(&self, system_prompt: &str, user_query: &str) -> EngineResult<String> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() { "gpt-4o-mini" } else { self.model.as_str() };
        let agent = client.agent(model_name).preamble(system_prompt).temperature(0.0).build();

        let response = agent
            .prompt(user_query)
            .await
            .map_err(|e| EngineError::TransientProvider(e.to_string()))?;

        Ok(response.trim().trim_start_matches("```json").trim_end_matches("```").trim().to_string())
    }
}

/// Plans a query, sanitizing the user's input before it reaches the
/// provider and validating the provider's output before anyone downstream
/// trusts it. Any failure along the way (provider error, malformed JSON,
/// rejected intent, dangerous parameter payload) falls back to a bare
/// `semantic_search` with empty parameters rather than propagating the
/// error to the caller.
pub async fn plan_query(provider: &dyn QueryPlanProvider, query: &str) -> QueryPlan {
    let sanitized_query = sanitize_for_prompt(query, "user query");

    let raw_response = match provider.complete_plan_json(QUERY_PLANNER_PROMPT, &sanitized_query).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to generate query plan");
            return QueryPlan::fallback();
        }
    };

    let raw_plan: Value = match serde_json::from_str(&raw_response) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, response = %raw_response, "query planner returned malformed JSON");
            return QueryPlan::fallback();
        }
    };

    let validated = validate_llm_json_output(&raw_plan, ALLOWED_INTENTS);
    let Some(intent) = validated.get("intent").and_then(Value::as_str) else {
        tracing::warn!("LLM query plan rejected by validation, falling back to semantic_search");
        return QueryPlan::fallback();
    };

    let parameters = validated.get("parameters").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    tracing::info!(intent, %parameters, "planned query");
    QueryPlan { intent: intent.to_string(), parameters }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        response: String,
    }

    #[async_trait]
    impl QueryPlanProvider for FakeProvider {
        async fn complete_plan_json(&self, _system_prompt: &str, _user_query: &str) -> EngineResult<String> {
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn accepts_a_well_formed_plan() {
        let provider = FakeProvider {
            response: serde_json::json!({
                "intent": "find_connections",
                "parameters": {"entity_names": ["Alice", "Bob"]}
            })
            .to_string(),
        };
        let plan = plan_query(&provider, "how are Alice and Bob connected?").await;
        assert_eq!(plan.intent, "find_connections");
        assert_eq!(plan.string_array_param("entity_names"), vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_on_unknown_intent() {
        let provider = FakeProvider { response: serde_json::json!({"intent": "drop_everything"}).to_string() };
        let plan = plan_query(&provider, "do something bad").await;
        assert_eq!(plan.intent, "semantic_search");
    }

    #[tokio::test]
    async fn falls_back_on_malformed_json() {
        let provider = FakeProvider { response: "not json at all".to_string() };
        let plan = plan_query(&provider, "whatever").await;
        assert_eq!(plan.intent, "semantic_search");
    }

    #[tokio::test]
    async fn falls_back_on_dangerous_cypher_in_parameters() {
        let provider = FakeProvider {
            response: serde_json::json!({
                "intent": "semantic_search",
                "parameters": {"entity_type": "MATCH (n) DETACH DELETE n"}
            })
            .to_string(),
        };
        let plan = plan_query(&provider, "whatever").await;
        assert_eq!(plan.intent, "semantic_search");
        assert_eq!(plan.parameters, serde_json::json!({}));
    }
}
