use serde_json::Value;

use crate::model::{BackendFamily, ModelDescriptor};
use crate::types::OptionBag;

/// Output-token cap to send, or `None` when the backend must not get one.
///
/// `bundle` is the already-resolved option bundle for the call. When a
/// thinking budget shares the model's ceiling with the output cap, the cap
/// shrinks so that `budget + cap <= model cap`.
pub fn max_output_tokens(
    model: &ModelDescriptor,
    bundle: &OptionBag,
    global_limit: u32,
    requested: Option<u32>,
) -> Option<u32> {
    if rejects_cap_with_effort(model, bundle) {
        return None;
    }

    let model_cap = if model.limit.output > 0 {
        model.limit.output
    } else {
        global_limit
    };
    let mut standard = model_cap.min(global_limit);
    if let Some(requested) = requested {
        standard = standard.min(requested);
    }

    match thinking_budget(model.family, bundle) {
        Some(budget) if budget.saturating_add(standard) > model_cap => {
            Some(model_cap.saturating_sub(budget))
        }
        _ => Some(standard),
    }
}

/// Codex-class OpenAI models and Copilot refuse an explicit cap alongside
/// a reasoning effort.
fn rejects_cap_with_effort(model: &ModelDescriptor, bundle: &OptionBag) -> bool {
    let affected = match model.family {
        BackendFamily::OpenAi => model.api_id().contains("codex"),
        BackendFamily::Copilot => true,
        _ => false,
    };
    affected && bundle.contains_key("reasoningEffort")
}

/// Enabled thinking budget that counts against the output ceiling.
pub fn thinking_budget(family: BackendFamily, bundle: &OptionBag) -> Option<u32> {
    let key = match family {
        BackendFamily::Anthropic => "thinking",
        BackendFamily::Bedrock => "reasoningConfig",
        _ => return None,
    };
    let config = bundle.get(key)?;
    if config.get("type").and_then(Value::as_str) != Some("enabled") {
        return None;
    }
    let budget = config.get("budgetTokens").and_then(Value::as_u64)?;
    if budget == 0 {
        return None;
    }
    Some(u32::try_from(budget).unwrap_or(u32::MAX))
}
