//! The intent plan produced by analysis.

use serde::Serialize;
use serde_json::{Map, Value, json};

use patchbay_core::{ErrorCode, RiskClass};

/// A deterministic mapping from free text to a canonical capability call,
/// with enough provenance (`reason_codes`, `confidence`) for the caller to
/// audit why.
#[derive(Debug, Clone, Serialize)]
pub struct IntentPlan {
    pub canonical_intent: String,
    pub confidence: f64,
    pub risk_class: RiskClass,
    pub reason_codes: Vec<String>,
    pub required_extensions: Vec<String>,
    pub target_capabilities: Vec<String>,
    pub clarification_required: bool,
    pub clarification_prompt: String,
    pub payload: Map<String, Value>,
    pub required_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl IntentPlan {
    /// The default plan: route to general model chat with the whole text as
    /// prompt.
    pub fn fallback(cleaned: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), json!(cleaned));
        Self {
            canonical_intent: "model.chat.complete".to_string(),
            confidence: 0.86,
            risk_class: RiskClass::Read,
            reason_codes: vec!["fallback_model_chat".to_string()],
            required_extensions: Vec::new(),
            target_capabilities: Vec::new(),
            clarification_required: false,
            clarification_prompt: String::new(),
            payload,
            required_confirmation: false,
            error_code: None,
        }
    }

    /// The plan for an empty prompt: low confidence, clarification needed.
    pub fn empty_prompt() -> Self {
        let mut plan = Self::fallback("");
        plan.confidence = 0.4;
        plan.clarification_required = true;
        plan.reason_codes = vec!["empty_prompt".to_string()];
        plan.clarification_prompt = "Please share what you want to do.".to_string();
        plan
    }

    /// Replace intent, confidence, reasons, and payload for a matched rule.
    pub fn set_rule(
        &mut self,
        intent: &str,
        confidence: f64,
        reasons: &[&str],
        payload: Map<String, Value>,
    ) {
        self.canonical_intent = intent.to_string();
        self.confidence = confidence;
        self.reason_codes = reasons.iter().map(|r| r.to_string()).collect();
        self.payload = payload;
    }
}
