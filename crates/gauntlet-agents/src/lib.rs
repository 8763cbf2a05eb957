#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use gauntlet_domain::{
    Component, EvalRecord, FinalDecision, GateDecision, GateResult, RecordPatch, Verdict,
    VerdictStatus,
};
use gauntlet_graph::{GraphBuilder, GraphDefinition, GraphError, RouteTarget, Step};
use gauntlet_provider::LlmClient;

/// Node names of the evaluation pipeline.
pub mod node {
    pub const GENERATOR: &str = "generator";
    pub const WORKFLOW_GATE: &str = "workflow_gate";
    pub const MARKET_EVAL: &str = "market_eval";
    pub const BUSINESS_EVAL: &str = "business_eval";
    pub const TECHNICAL_EVAL: &str = "technical_eval";
    pub const ARBITER: &str = "arbiter";
}

/// Routing labels on the gate's conditional edge.
pub mod route {
    pub const PROCEED: &str = "proceed";
    pub const KILL: &str = "kill";
}

const GENERATOR_PROMPT: &str = include_str!("../prompts/generator.txt");
const GATE_PROMPT: &str = include_str!("../prompts/workflow_gate.txt");
const MARKET_PROMPT: &str = include_str!("../prompts/market.txt");
const BUSINESS_PROMPT: &str = include_str!("../prompts/business.txt");
const TECHNICAL_PROMPT: &str = include_str!("../prompts/technical.txt");

/// Shared dependencies handed to every agent at graph build time.
#[derive(Clone)]
pub struct EvalContext {
    pub llm: Arc<dyn LlmClient>,
}

impl EvalContext {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

/// Produces the startup brief when the run was not seeded with one.
pub struct BriefGenerator {
    ctx: EvalContext,
}

impl BriefGenerator {
    #[must_use]
    pub fn new(ctx: EvalContext) -> Self {
        Self { ctx }
    }
}

impl Step<EvalRecord> for BriefGenerator {
    fn execute(&self, state: &EvalRecord) -> Result<RecordPatch> {
        if state.brief.is_some() {
            // Seeded run. The caller supplied the brief up front.
            return Ok(RecordPatch::default());
        }
        let raw = self
            .ctx
            .llm
            .generate(GENERATOR_PROMPT, "Generate one B2B startup idea")?;
        let brief: serde_json::Value =
            serde_json::from_str(&raw).context("brief response was not valid JSON")?;
        Ok(RecordPatch {
            brief: Some(brief),
            ..RecordPatch::default()
        })
    }
}

/// First filter: is the brief a real workflow problem at all?
///
/// A response that fails to parse is treated as a KILL, not a run failure;
/// the gate exists to stop bad briefs, and an incoherent gate answer must
/// never wave one through.
pub struct WorkflowGate {
    ctx: EvalContext,
}

impl WorkflowGate {
    #[must_use]
    pub fn new(ctx: EvalContext) -> Self {
        Self { ctx }
    }
}

impl Step<EvalRecord> for WorkflowGate {
    fn execute(&self, state: &EvalRecord) -> Result<RecordPatch> {
        let brief = state
            .brief
            .as_ref()
            .ok_or_else(|| anyhow!("workflow gate invoked without a brief"))?;
        let user = format!(
            "Analyze this startup brief for Workflow Reality:\n\n{}",
            serde_json::to_string_pretty(brief)?
        );
        let raw = self.ctx.llm.generate(GATE_PROMPT, &user)?;

        let gate = match serde_json::from_str::<GateResult>(&raw) {
            Ok(gate) => gate,
            Err(err) => GateResult {
                decision: GateDecision::Kill,
                reason: format!("gate response parse failure: {err}"),
                confidence: 0.0,
            },
        };

        // A gate kill is the final word; no arbiter will run.
        let final_decision =
            (gate.decision == GateDecision::Kill).then_some(FinalDecision::Kill);
        Ok(RecordPatch {
            gate_result: Some(gate),
            final_decision,
            ..RecordPatch::default()
        })
    }
}

fn route_gate(state: &EvalRecord) -> String {
    match state.gate_result.as_ref().map(|gate| gate.decision) {
        Some(GateDecision::Pass) => route::PROCEED.to_string(),
        _ => route::KILL.to_string(),
    }
}

/// One specialist evaluator. The component decides which prompt it speaks
/// with and which verdict slot it fills.
pub struct VerdictEvaluator {
    ctx: EvalContext,
    component: Component,
}

impl VerdictEvaluator {
    #[must_use]
    pub fn new(ctx: EvalContext, component: Component) -> Self {
        Self { ctx, component }
    }

    fn prompt(&self) -> &'static str {
        match self.component {
            Component::Market => MARKET_PROMPT,
            Component::Business => BUSINESS_PROMPT,
            Component::Technical => TECHNICAL_PROMPT,
        }
    }
}

impl Step<EvalRecord> for VerdictEvaluator {
    fn execute(&self, state: &EvalRecord) -> Result<RecordPatch> {
        let name = self.component.as_str();
        let brief = state
            .brief
            .as_ref()
            .ok_or_else(|| anyhow!("{name} evaluator invoked without a brief"))?;
        let user = format!(
            "Evaluate the following B2B startup idea for its {name} potential:\n{}\n\n\
             Provide your evaluation in the following JSON format:\n\
             {{\"component\": \"{name}\", \"status\": \"PASS\" or \"KILL\", \
             \"confidence\": a float between 0 and 1, \"reason\": \"detailed explanation\"}}",
            serde_json::to_string_pretty(brief)?
        );
        let raw = self.ctx.llm.generate(self.prompt(), &user)?;

        // An unparseable specialist answer degrades to a KILL verdict so the
        // arbiter still sees all three slots filled.
        let verdict = match serde_json::from_str::<Verdict>(&raw) {
            Ok(verdict) => verdict,
            Err(err) => Verdict {
                component: name.to_string(),
                status: VerdictStatus::Kill,
                confidence: 0.0,
                reason: format!("{name} response parse failure: {err}"),
            },
        };

        let mut patch = RecordPatch::default();
        patch.set_verdict(self.component, verdict);
        Ok(patch)
    }
}

/// Deterministic final decision over the three verdict slots.
///
/// KILL outranks INSUFFICIENT_INFO outranks PASS, and BUILD additionally
/// requires all three slots filled. A missing slot can only mean the run
/// reached the arbiter through a path that skipped an evaluator, and that
/// is never grounds to build.
#[must_use]
pub fn arbitrate(record: &EvalRecord) -> FinalDecision {
    let verdicts: Vec<&Verdict> = Component::ALL
        .iter()
        .filter_map(|component| record.verdict(*component))
        .collect();
    if verdicts
        .iter()
        .any(|verdict| verdict.status == VerdictStatus::Kill)
    {
        return FinalDecision::Kill;
    }
    if verdicts
        .iter()
        .any(|verdict| verdict.status == VerdictStatus::InsufficientInfo)
    {
        return FinalDecision::InsufficientInfo;
    }
    if verdicts.len() == Component::ALL.len() {
        FinalDecision::Build
    } else {
        FinalDecision::Kill
    }
}

pub struct FinalArbiter;

impl Step<EvalRecord> for FinalArbiter {
    fn execute(&self, state: &EvalRecord) -> Result<RecordPatch> {
        Ok(RecordPatch {
            final_decision: Some(arbitrate(state)),
            ..RecordPatch::default()
        })
    }
}

/// Assemble the evaluation pipeline.
///
/// generator -> workflow_gate, then a conditional edge that either fans out
/// to the three specialists (which join at the arbiter) or ends the run on a
/// gate kill.
///
/// # Errors
/// Returns a `GraphError` if the topology fails validation; with the fixed
/// wiring below that indicates a bug, not bad input.
pub fn build_eval_graph(ctx: &EvalContext) -> Result<GraphDefinition<EvalRecord>, GraphError> {
    let mut builder = GraphBuilder::new();
    builder.add_node(node::GENERATOR, BriefGenerator::new(ctx.clone()))?;
    builder.add_node(node::WORKFLOW_GATE, WorkflowGate::new(ctx.clone()))?;
    builder.add_node(
        node::MARKET_EVAL,
        VerdictEvaluator::new(ctx.clone(), Component::Market),
    )?;
    builder.add_node(
        node::BUSINESS_EVAL,
        VerdictEvaluator::new(ctx.clone(), Component::Business),
    )?;
    builder.add_node(
        node::TECHNICAL_EVAL,
        VerdictEvaluator::new(ctx.clone(), Component::Technical),
    )?;
    builder.add_node(node::ARBITER, FinalArbiter)?;

    builder.add_edge(node::GENERATOR, node::WORKFLOW_GATE);

    let mut targets = BTreeMap::new();
    targets.insert(
        route::PROCEED.to_string(),
        RouteTarget::fan_out([node::MARKET_EVAL, node::BUSINESS_EVAL, node::TECHNICAL_EVAL]),
    );
    targets.insert(route::KILL.to_string(), RouteTarget::End);
    builder.add_conditional_edge(node::WORKFLOW_GATE, route_gate, targets)?;

    builder.add_edge(node::MARKET_EVAL, node::ARBITER);
    builder.add_edge(node::BUSINESS_EVAL, node::ARBITER);
    builder.add_edge(node::TECHNICAL_EVAL, node::ARBITER);
    builder.set_entry(node::GENERATOR);
    builder.set_finish(node::ARBITER);
    builder.build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use gauntlet_domain::{
        Component, EvalRecord, FinalDecision, GateDecision, RecordPatch, RunId, Verdict,
        VerdictStatus,
    };
    use gauntlet_graph::{RunState, Step};
    use gauntlet_provider::LlmClient;
    use serde_json::json;

    use super::{arbitrate, route_gate, BriefGenerator, EvalContext, VerdictEvaluator, WorkflowGate};

    /// Client that returns the same text for every call.
    struct TextLlm(String);

    impl LlmClient for TextLlm {
        fn generate(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn ctx_with(text: &str) -> EvalContext {
        EvalContext::new(Arc::new(TextLlm(text.to_string())))
    }

    fn verdict(component: Component, status: VerdictStatus) -> Verdict {
        Verdict {
            component: component.as_str().to_string(),
            status,
            confidence: 0.5,
            reason: "test".to_string(),
        }
    }

    fn record_with(statuses: [VerdictStatus; 3]) -> EvalRecord {
        let mut record = EvalRecord::new(RunId::new());
        let mut patch = RecordPatch::default();
        for (component, status) in Component::ALL.into_iter().zip(statuses) {
            patch.set_verdict(component, verdict(component, status));
        }
        record.merge(patch);
        record
    }

    #[test]
    fn arbiter_covers_every_status_combination() {
        let all = [
            VerdictStatus::Pass,
            VerdictStatus::Kill,
            VerdictStatus::InsufficientInfo,
        ];
        for market in all {
            for business in all {
                for technical in all {
                    let statuses = [market, business, technical];
                    let expected = if statuses.contains(&VerdictStatus::Kill) {
                        FinalDecision::Kill
                    } else if statuses.contains(&VerdictStatus::InsufficientInfo) {
                        FinalDecision::InsufficientInfo
                    } else {
                        FinalDecision::Build
                    };
                    assert_eq!(
                        arbitrate(&record_with(statuses)),
                        expected,
                        "{statuses:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn arbiter_never_builds_on_a_missing_slot() {
        let mut record = EvalRecord::new(RunId::new());
        let mut patch = RecordPatch::default();
        patch.set_verdict(Component::Market, verdict(Component::Market, VerdictStatus::Pass));
        patch.set_verdict(
            Component::Business,
            verdict(Component::Business, VerdictStatus::Pass),
        );
        record.merge(patch);
        assert_eq!(arbitrate(&record), FinalDecision::Kill);
    }

    #[test]
    fn generator_skips_a_seeded_brief() {
        let generator = BriefGenerator::new(ctx_with("{\"should\": \"not be used\"}"));
        let mut state = EvalRecord::new(RunId::new());
        state.brief = Some(json!({"concept_hook": "seeded"}));

        let patch = generator.execute(&state);
        assert!(patch.is_ok());
        let patch = patch.unwrap_or_else(|_| unreachable!());
        assert!(patch.brief.is_none());
    }

    #[test]
    fn generator_rejects_malformed_brief_text() {
        let generator = BriefGenerator::new(ctx_with("not json"));
        let state = EvalRecord::new(RunId::new());
        assert!(generator.execute(&state).is_err());
    }

    #[test]
    fn gate_parse_failure_fails_closed() {
        let gate = WorkflowGate::new(ctx_with("total nonsense"));
        let mut state = EvalRecord::new(RunId::new());
        state.brief = Some(json!({"concept_hook": "x"}));

        let patch = gate.execute(&state);
        assert!(patch.is_ok());
        let patch = patch.unwrap_or_else(|_| unreachable!());
        let gate_result = patch.gate_result;
        assert!(gate_result.is_some());
        let gate_result = gate_result.unwrap_or_else(|| unreachable!());
        assert_eq!(gate_result.decision, GateDecision::Kill);
        assert!(gate_result.reason.contains("parse failure"));
        assert_eq!(patch.final_decision, Some(FinalDecision::Kill));
    }

    #[test]
    fn gate_without_a_brief_is_an_error() {
        let gate = WorkflowGate::new(ctx_with("{}"));
        let state = EvalRecord::new(RunId::new());
        assert!(gate.execute(&state).is_err());
    }

    #[test]
    fn gate_routing_fails_closed_without_a_result() {
        let state = EvalRecord::new(RunId::new());
        assert_eq!(route_gate(&state), super::route::KILL);
    }

    #[test]
    fn evaluator_parse_failure_degrades_to_kill() {
        let evaluator = VerdictEvaluator::new(ctx_with("not json"), Component::Technical);
        let mut state = EvalRecord::new(RunId::new());
        state.brief = Some(json!({"concept_hook": "x"}));

        let patch = evaluator.execute(&state);
        assert!(patch.is_ok());
        let patch = patch.unwrap_or_else(|_| unreachable!());
        let verdict = patch.technical_verdict;
        assert!(verdict.is_some());
        let verdict = verdict.unwrap_or_else(|| unreachable!());
        assert_eq!(verdict.status, VerdictStatus::Kill);
        assert_eq!(verdict.component, "technical");
        assert!(verdict.reason.contains("parse failure"));
        assert!(patch.market_verdict.is_none());
    }
}
