use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::json;

use gauntlet_agents::{build_eval_graph, EvalContext};
use gauntlet_domain::{EvalRecord, FinalDecision, GateDecision, RunId, VerdictStatus};
use gauntlet_executor::{Executor, ExecutorConfig};
use gauntlet_provider::{LlmClient, MockLlm};

/// Mock wrapper that answers generator calls with a fixed brief and counts
/// how often each agent spoke. Gate and specialist calls fall through to the
/// stock mock so its kill markers keep working.
struct ScriptedLlm {
    brief: serde_json::Value,
    inner: MockLlm,
    calls: Mutex<BTreeMap<&'static str, usize>>,
}

impl ScriptedLlm {
    fn new(brief: serde_json::Value) -> Self {
        Self {
            brief,
            inner: MockLlm::new(),
            calls: Mutex::new(BTreeMap::new()),
        }
    }

    fn count(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl LlmClient for ScriptedLlm {
    fn generate(&self, system: &str, user: &str) -> Result<String> {
        let kind = if system.contains("Gatekeeper") {
            "gate"
        } else if system.contains("MARKET") {
            "market"
        } else if system.contains("BUSINESS") {
            "business"
        } else if system.contains("TECHNICAL") {
            "technical"
        } else {
            "generator"
        };
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(kind).or_insert(0) += 1;
        }
        if kind == "generator" {
            return Ok(self.brief.to_string());
        }
        self.inner.generate(system, user)
    }
}

fn run_with(llm: Arc<ScriptedLlm>, parallel: bool) -> EvalRecord {
    let ctx = EvalContext::new(llm);
    let graph = build_eval_graph(&ctx);
    assert!(graph.is_ok());
    let graph = graph.unwrap_or_else(|_| unreachable!());

    let executor = Executor::new(ExecutorConfig {
        parallel,
        ..ExecutorConfig::default()
    });
    let record = executor.invoke(&graph, EvalRecord::new(RunId::new()));
    match record {
        Ok(record) => record,
        Err(err) => panic!("pipeline run failed: {err}"),
    }
}

fn brief(concept_hook: &str) -> serde_json::Value {
    json!({
        "concept_hook": concept_hook,
        "target_customer": "Operations leads at mid-size logistics firms",
        "core_pain_point": "Manual rekeying between dispatch and billing systems",
        "mechanism": "Watches both systems and reconciles records automatically",
        "monetization": "Per-seat monthly subscription",
        "why_now": "Both systems finally expose usable APIs",
        "distribution_channel": "Industry trade shows and integration marketplaces",
    })
}

#[test]
fn clean_brief_survives_the_full_gauntlet() {
    let llm = Arc::new(ScriptedLlm::new(brief("Reconciliation copilot for freight back offices")));
    let record = run_with(Arc::clone(&llm), true);

    assert_eq!(record.final_decision, Some(FinalDecision::Build));
    assert_eq!(
        record.gate_result.as_ref().map(|gate| gate.decision),
        Some(GateDecision::Pass)
    );
    for slot in [
        &record.market_verdict,
        &record.business_verdict,
        &record.technical_verdict,
    ] {
        assert_eq!(
            slot.as_ref().map(|verdict| verdict.status),
            Some(VerdictStatus::Pass)
        );
    }

    assert_eq!(llm.count("generator"), 1);
    assert_eq!(llm.count("gate"), 1);
    assert_eq!(llm.count("market"), 1);
    assert_eq!(llm.count("business"), 1);
    assert_eq!(llm.count("technical"), 1);
}

#[test]
fn gate_kill_short_circuits_the_specialists() {
    let llm = Arc::new(ScriptedLlm::new(brief("Tinder for Dogs")));
    let record = run_with(Arc::clone(&llm), true);

    assert_eq!(record.final_decision, Some(FinalDecision::Kill));
    assert_eq!(
        record.gate_result.as_ref().map(|gate| gate.decision),
        Some(GateDecision::Kill)
    );
    assert!(record.market_verdict.is_none());
    assert!(record.business_verdict.is_none());
    assert!(record.technical_verdict.is_none());

    assert_eq!(llm.count("gate"), 1);
    assert_eq!(llm.count("market"), 0);
    assert_eq!(llm.count("business"), 0);
    assert_eq!(llm.count("technical"), 0);
}

#[test]
fn single_specialist_kill_decides_the_run() {
    let llm = Arc::new(ScriptedLlm::new(brief("Social Network for welders")));
    let record = run_with(Arc::clone(&llm), true);

    assert_eq!(record.final_decision, Some(FinalDecision::Kill));
    assert_eq!(
        record.gate_result.as_ref().map(|gate| gate.decision),
        Some(GateDecision::Pass)
    );
    assert_eq!(
        record.market_verdict.as_ref().map(|verdict| verdict.status),
        Some(VerdictStatus::Kill)
    );
    assert_eq!(
        record.business_verdict.as_ref().map(|verdict| verdict.status),
        Some(VerdictStatus::Pass)
    );
    assert_eq!(
        record
            .technical_verdict
            .as_ref()
            .map(|verdict| verdict.status),
        Some(VerdictStatus::Pass)
    );
    assert_eq!(llm.count("market"), 1);
    assert_eq!(llm.count("technical"), 1);
}

#[test]
fn sequential_execution_reaches_the_same_decision() {
    let concept = "Reconciliation copilot for freight back offices";
    let parallel = run_with(Arc::new(ScriptedLlm::new(brief(concept))), true);
    let sequential = run_with(Arc::new(ScriptedLlm::new(brief(concept))), false);

    assert_eq!(parallel.final_decision, sequential.final_decision);
    assert_eq!(parallel.gate_result, sequential.gate_result);
    assert_eq!(parallel.market_verdict, sequential.market_verdict);
    assert_eq!(parallel.business_verdict, sequential.business_verdict);
    assert_eq!(parallel.technical_verdict, sequential.technical_verdict);
}
