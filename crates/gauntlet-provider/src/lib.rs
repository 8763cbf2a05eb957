#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

/// Blocking text-generation client.
///
/// Agents hand the client a system prompt and a user message and get the raw
/// model text back; parsing and validation stay on the agent side.
pub trait LlmClient: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn generate(&self, system: &str, user: &str) -> Result<String>;
}

/// Deterministic offline client for tests and demo runs.
///
/// Dispatches on marker words in the system prompt to decide which agent is
/// calling, then scans the user message for known doomed concepts to pick the
/// negative response.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockLlm;

impl MockLlm {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn mock_gate(user: &str) -> Value {
    if user.contains("Tinder for Dogs") || user.contains("Recipe Generator") {
        json!({
            "decision": "KILL",
            "reason": "Concept is a known novelty pattern with no durable demand.",
            "confidence": 0.92,
        })
    } else {
        json!({
            "decision": "PASS",
            "reason": "Concept is coherent enough to merit a full evaluation.",
            "confidence": 0.74,
        })
    }
}

fn mock_verdict(component: &str, user: &str, kill_marker: &str, kill_reason: &str) -> Value {
    if user.contains(kill_marker) {
        json!({
            "component": component,
            "status": "KILL",
            "confidence": 0.88,
            "reason": kill_reason,
        })
    } else {
        json!({
            "component": component,
            "status": "PASS",
            "confidence": 0.81,
            "reason": format!("No disqualifying {component} risk found."),
        })
    }
}

fn mock_brief() -> Value {
    json!({
        "concept_hook": "Compliance autopilot for solo landlords",
        "target_customer": "Independent landlords with two to ten units",
        "core_pain_point": "Keeping up with shifting local rental regulations",
        "mechanism": "Monitors municipal rule changes and generates the required filings",
        "monetization": "Monthly subscription per managed unit",
        "why_now": "Cities are digitizing rental registries and enforcement",
        "distribution_channel": "Landlord association newsletters and property tax mailing lists",
    })
}

impl LlmClient for MockLlm {
    fn generate(&self, system: &str, user: &str) -> Result<String> {
        let value = if system.contains("Gatekeeper") {
            mock_gate(user)
        } else if system.contains("MARKET") {
            mock_verdict(
                "market",
                user,
                "Social Network",
                "Winner-take-all market already captured by incumbents.",
            )
        } else if system.contains("BUSINESS") {
            mock_verdict(
                "business",
                user,
                "Blockchain",
                "No credible revenue mechanism beyond token speculation.",
            )
        } else if system.contains("TECHNICAL") {
            mock_verdict(
                "technical",
                user,
                "Uber for Lawn",
                "Unit economics collapse under real-world logistics constraints.",
            )
        } else {
            mock_brief()
        };
        Ok(value.to_string())
    }
}

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmConfig {
    pub url: String,
    pub model_id: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Extra headers sent verbatim with every request.
    pub headers: BTreeMap<String, String>,
    /// Name of the environment variable holding the bearer token. The token
    /// itself never appears in config values or logs.
    pub auth_bearer_env: Option<String>,
}

impl HttpLlmConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model_id: model_id.into(),
            timeout_ms: 30_000,
            max_tokens: 500,
            temperature: 0.7,
            headers: BTreeMap::new(),
            auth_bearer_env: None,
        }
    }
}

/// Client for OpenAI-compatible chat-completions APIs.
pub struct HttpJsonLlm {
    agent: ureq::Agent,
    config: HttpLlmConfig,
}

impl HttpJsonLlm {
    #[must_use]
    pub fn new(config: HttpLlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self { agent, config }
    }
}

impl LlmClient for HttpJsonLlm {
    fn generate(&self, system: &str, user: &str) -> Result<String> {
        let mut request = self
            .agent
            .post(&self.config.url)
            .set("content-type", "application/json");
        for (name, value) in &self.config.headers {
            request = request.set(name, value);
        }
        if let Some(var) = &self.config.auth_bearer_env {
            let token = std::env::var(var)
                .with_context(|| format!("auth token variable '{var}' is not set"))?;
            request = request.set("authorization", &format!("Bearer {token}"));
        }

        let body = json!({
            "model": self.config.model_id,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let response: Value = request
            .send_json(body)
            .context("chat completion request failed")?
            .into_json()
            .context("chat completion response was not JSON")?;
        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("chat completion response has no message content"))?;
        Ok(content.to_string())
    }
}

/// Which client an evaluation run talks to.
#[derive(Debug, Clone)]
pub enum LlmConfig {
    Mock,
    HttpJson(HttpLlmConfig),
}

impl LlmConfig {
    #[must_use]
    pub fn build(self) -> Arc<dyn LlmClient> {
        match self {
            Self::Mock => Arc::new(MockLlm::new()),
            Self::HttpJson(config) => Arc::new(HttpJsonLlm::new(config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use gauntlet_domain::{GateDecision, GateResult, Verdict, VerdictStatus};

    use super::{HttpLlmConfig, LlmClient, MockLlm};

    fn generate(system: &str, user: &str) -> String {
        match MockLlm::new().generate(system, user) {
            Ok(text) => text,
            Err(err) => panic!("mock generate failed: {err}"),
        }
    }

    fn parse_verdict(text: &str) -> Verdict {
        match serde_json::from_str(text) {
            Ok(verdict) => verdict,
            Err(err) => panic!("mock verdict did not parse: {err}"),
        }
    }

    #[test]
    fn gate_kills_known_doomed_concepts() {
        let text = generate("You are the Gatekeeper.", "Evaluate: Tinder for Dogs");
        let parsed: Result<GateResult, _> = serde_json::from_str(&text);
        assert!(parsed.is_ok());
        assert_eq!(parsed.map(|g| g.decision).ok(), Some(GateDecision::Kill));
    }

    #[test]
    fn gate_passes_other_concepts() {
        let text = generate("You are the Gatekeeper.", "Evaluate: landlord compliance");
        let parsed: Result<GateResult, _> = serde_json::from_str(&text);
        assert!(parsed.is_ok());
        assert_eq!(parsed.map(|g| g.decision).ok(), Some(GateDecision::Pass));
    }

    #[test]
    fn each_specialist_has_its_own_kill_marker() {
        let cases = [
            ("MARKET analyst", "market", "Social Network"),
            ("BUSINESS analyst", "business", "Blockchain"),
            ("TECHNICAL analyst", "technical", "Uber for Lawn mowing"),
        ];
        for (system, component, marker) in cases {
            let kill = parse_verdict(&generate(system, &format!("Concept: {marker}")));
            assert_eq!(kill.status, VerdictStatus::Kill, "{component}");
            assert_eq!(kill.component, component);

            let pass = parse_verdict(&generate(system, "Concept: boring B2B tooling"));
            assert_eq!(pass.status, VerdictStatus::Pass, "{component}");
        }
    }

    #[test]
    fn unmarked_system_prompt_yields_a_brief() {
        let text = generate("You produce startup briefs.", "Generate one brief.");
        let parsed: Result<serde_json::Value, _> = serde_json::from_str(&text);
        assert!(parsed.is_ok());
        let brief = parsed.unwrap_or_else(|_| unreachable!());
        for key in [
            "concept_hook",
            "target_customer",
            "core_pain_point",
            "mechanism",
            "monetization",
            "why_now",
            "distribution_channel",
        ] {
            assert!(brief.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn http_config_defaults_match_the_api_contract() {
        let config = HttpLlmConfig::new("http://localhost:8080/v1/chat/completions", "gpt-4o-mini");
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.max_tokens, 500);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.auth_bearer_env.is_none());
    }
}
