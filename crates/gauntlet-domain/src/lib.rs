#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

use gauntlet_graph::RunState;

/// Identifier for one evaluation run. Lexicographic order follows creation
/// time, which keeps archive listings chronologically sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of the viability gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    Pass,
    Kill,
}

impl GateDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Kill => "KILL",
        }
    }
}

/// Outcome of one specialist evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Pass,
    Kill,
    InsufficientInfo,
}

impl VerdictStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Kill => "KILL",
            Self::InsufficientInfo => "INSUFFICIENT_INFO",
        }
    }
}

/// Terminal decision for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    Build,
    Kill,
    InsufficientInfo,
}

impl FinalDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "BUILD",
            Self::Kill => "KILL",
            Self::InsufficientInfo => "INSUFFICIENT_INFO",
        }
    }
}

/// The three specialist lenses a brief is judged through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Market,
    Business,
    Technical,
}

impl Component {
    pub const ALL: [Self; 3] = [Self::Market, Self::Business, Self::Technical];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Business => "business",
            Self::Technical => "technical",
        }
    }
}

/// Parsed gate response. Unknown fields are rejected so a drifting model
/// contract surfaces as a parse failure instead of silently losing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateResult {
    pub decision: GateDecision,
    pub reason: String,
    pub confidence: f32,
}

/// Parsed specialist response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verdict {
    pub component: String,
    pub status: VerdictStatus,
    pub confidence: f32,
    pub reason: String,
}

/// Accumulated state of one run. Every step reads a snapshot of this record
/// and contributes a `RecordPatch`; only the executor writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub run_id: RunId,
    pub brief: Option<serde_json::Value>,
    pub gate_result: Option<GateResult>,
    pub market_verdict: Option<Verdict>,
    pub business_verdict: Option<Verdict>,
    pub technical_verdict: Option<Verdict>,
    pub final_decision: Option<FinalDecision>,
}

impl EvalRecord {
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            brief: None,
            gate_result: None,
            market_verdict: None,
            business_verdict: None,
            technical_verdict: None,
            final_decision: None,
        }
    }

    #[must_use]
    pub fn verdict(&self, component: Component) -> Option<&Verdict> {
        match component {
            Component::Market => self.market_verdict.as_ref(),
            Component::Business => self.business_verdict.as_ref(),
            Component::Technical => self.technical_verdict.as_ref(),
        }
    }
}

/// Partial update to an `EvalRecord`. `None` fields leave the record
/// untouched; the run id is never patchable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub brief: Option<serde_json::Value>,
    pub gate_result: Option<GateResult>,
    pub market_verdict: Option<Verdict>,
    pub business_verdict: Option<Verdict>,
    pub technical_verdict: Option<Verdict>,
    pub final_decision: Option<FinalDecision>,
}

impl RecordPatch {
    pub fn set_verdict(&mut self, component: Component, verdict: Verdict) {
        match component {
            Component::Market => self.market_verdict = Some(verdict),
            Component::Business => self.business_verdict = Some(verdict),
            Component::Technical => self.technical_verdict = Some(verdict),
        }
    }
}

impl RunState for EvalRecord {
    type Patch = RecordPatch;

    fn merge(&mut self, patch: RecordPatch) {
        if let Some(brief) = patch.brief {
            self.brief = Some(brief);
        }
        if let Some(gate_result) = patch.gate_result {
            self.gate_result = Some(gate_result);
        }
        if let Some(verdict) = patch.market_verdict {
            self.market_verdict = Some(verdict);
        }
        if let Some(verdict) = patch.business_verdict {
            self.business_verdict = Some(verdict);
        }
        if let Some(verdict) = patch.technical_verdict {
            self.technical_verdict = Some(verdict);
        }
        if let Some(decision) = patch.final_decision {
            self.final_decision = Some(decision);
        }
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a JSON value over its canonical serialization.
///
/// # Errors
/// Returns an error when the value cannot be serialized.
pub fn hash_json(value: &serde_json::Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Current UTC time as an RFC 3339 string.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn now_rfc3339() -> anyhow::Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}
