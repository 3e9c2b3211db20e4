use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{BackendFamily, ModelDescriptor};
use crate::types::OptionBag;

use ReasoningEffort as E;

/// Unified reasoning dial, ordered from least to most effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    #[serde(rename = "xhigh")]
    XHigh,
    Max,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::XHigh => "xhigh",
            ReasoningEffort::Max => "max",
        }
    }
}

impl std::fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ReasoningEffort::None),
            "minimal" => Ok(ReasoningEffort::Minimal),
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "xhigh" => Ok(ReasoningEffort::XHigh),
            "max" => Ok(ReasoningEffort::Max),
            other => Err(format!("unknown reasoning effort '{other}'")),
        }
    }
}

/// Thinking budget for the high tier of budget-based backends.
pub const HIGH_THINKING_BUDGET: u32 = 16_000;
/// Thinking budget for the max tier of Claude-style backends.
pub const MAX_THINKING_BUDGET: u32 = 31_999;
/// Gemini 2.5 caps its thinking budget lower than Claude.
pub const GEMINI_MAX_THINKING_BUDGET: u32 = 24_576;

const OPENAI_NONE_SINCE: &str = "2025-11-13";
const OPENAI_XHIGH_SINCE: &str = "2025-12-04";


/// Efforts `model` accepts, ascending. Empty when it takes no reasoning dial.
pub fn efforts(model: &ModelDescriptor) -> Vec<ReasoningEffort> {
    if !model.capabilities.reasoning {
        return Vec::new();
    }
    let id = model.api_id();
    if ["deepseek", "minimax", "glm", "mistral"].iter().any(|k| id.contains(k)) {
        return Vec::new();
    }

    match model.family {
        BackendFamily::OpenRouter => {
            if id.contains("gpt") || id.contains("gemini-3") {
                vec![E::None, E::Minimal, E::Low, E::Medium, E::High, E::XHigh]
            } else {
                Vec::new()
            }
        }
        BackendFamily::OpenAi | BackendFamily::Copilot => openai_efforts(model, &id),
        BackendFamily::Azure => {
            if id == "o1-mini" {
                Vec::new()
            } else {
                openai_efforts(model, &id)
            }
        }
        BackendFamily::Anthropic => vec![E::High, E::Max],
        BackendFamily::Bedrock => {
            if model.is_claude() {
                vec![E::High, E::Max]
            } else {
                Vec::new()
            }
        }
        BackendFamily::Google | BackendFamily::GoogleVertex => {
            if id.contains("2.5") {
                vec![E::High, E::Max]
            } else {
                vec![E::Low, E::High]
            }
        }
        BackendFamily::Xai => {
            if id.contains("grok-3-mini") {
                vec![E::Low, E::High]
            } else {
                Vec::new()
            }
        }
        BackendFamily::Gateway => Vec::new(),
        BackendFamily::OpenAiCompatible | BackendFamily::Mistral | BackendFamily::Other => {
            vec![E::Low, E::Medium, E::High]
        }
    }
}

fn openai_efforts(model: &ModelDescriptor, id: &str) -> Vec<ReasoningEffort> {
    if id == "gpt-5-pro" {
        return Vec::new();
    }
    if id.contains("codex") {
        return if id.contains("5.2") {
            vec![E::Low, E::Medium, E::High, E::XHigh]
        } else {
            vec![E::Low, E::Medium, E::High]
        };
    }
    let mut out = vec![E::Low, E::Medium, E::High];
    if id == "gpt-5" || id.starts_with("gpt-5-") {
        out.insert(0, E::Minimal);
    }
    if model.released_on_or_after(OPENAI_NONE_SINCE) {
        out.insert(0, E::None);
    }
    if model.released_on_or_after(OPENAI_XHIGH_SINCE) {
        out.push(E::XHigh);
    }
    out
}

/// Closest allowed effort: the highest not above `wanted`, else the lowest.
pub fn snap(allowed: &[ReasoningEffort], wanted: ReasoningEffort) -> Option<ReasoningEffort> {
    allowed
        .iter()
        .copied()
        .filter(|e| *e <= wanted)
        .max()
        .or_else(|| allowed.iter().copied().min())
}

/// Options expressing `effort` for `model`, or `None` when the model has
/// no reasoning dial.
pub fn variant(model: &ModelDescriptor, effort: ReasoningEffort) -> Option<OptionBag> {
    let allowed = efforts(model);
    let wanted = effort;
    let effort = snap(&allowed, wanted)?;
    if effort != wanted {
        tracing::debug!("Reasoning effort {} snapped to {} for {}", wanted, effort, model.model_ref());
    }
    let id = model.api_id();

    let value = match model.family {
        BackendFamily::OpenRouter => json!({"reasoning": {"effort": effort.as_str()}}),
        BackendFamily::OpenAi | BackendFamily::Azure | BackendFamily::Copilot => json!({
            "reasoningEffort": effort.as_str(),
            "reasoningSummary": "auto",
            "include": ["reasoning.encrypted_content"],
        }),
        BackendFamily::Anthropic => json!({
            "thinking": {"type": "enabled", "budgetTokens": claude_budget(effort)},
        }),
        BackendFamily::Bedrock => json!({
            "reasoningConfig": {"type": "enabled", "budgetTokens": claude_budget(effort)},
        }),
        BackendFamily::Google | BackendFamily::GoogleVertex => {
            if id.contains("2.5") {
                let budget = if effort == E::Max {
                    GEMINI_MAX_THINKING_BUDGET
                } else {
                    HIGH_THINKING_BUDGET
                };
                json!({"thinkingConfig": {"includeThoughts": true, "thinkingBudget": budget}})
            } else {
                json!({"thinkingConfig": {"includeThoughts": true, "thinkingLevel": effort.as_str()}})
            }
        }
        _ => json!({"reasoningEffort": effort.as_str()}),
    };
    into_bag(value)
}

fn claude_budget(effort: ReasoningEffort) -> u32 {
    if effort == E::Max {
        MAX_THINKING_BUDGET
    } else {
        HIGH_THINKING_BUDGET
    }
}

/// Options every request to `model` carries unless the caller overrides them.
pub fn default_options(model: &ModelDescriptor, session_id: &str, caller: &OptionBag) -> OptionBag {
    let id = model.api_id();
    let backend = model.backend_id.as_str();
    let mut out = OptionBag::new();

    if model.family == BackendFamily::OpenRouter {
        out.insert("usage".into(), json!({"include": true}));
        if id.contains("gemini-3") {
            out.insert("reasoning".into(), json!({"effort": "high"}));
        }
    }

    if backend == "baseten" {
        out.insert("chat_template_args".into(), json!({"enable_thinking": true}));
    }

    if matches!(backend, "zai" | "zhipuai") && model.family == BackendFamily::OpenAiCompatible {
        out.insert("thinking".into(), json!({"type": "enabled", "clear_thinking": false}));
    }

    let wants_cache_key = caller.get("setCacheKey").and_then(Value::as_bool).unwrap_or(false);
    if backend == "openai" || wants_cache_key {
        out.insert("promptCacheKey".into(), json!(session_id));
    }

    if matches!(model.family, BackendFamily::Google | BackendFamily::GoogleVertex) && model.capabilities.reasoning {
        let mut thinking = json!({"includeThoughts": true});
        if id.contains("gemini-3") {
            thinking["thinkingLevel"] = json!("high");
        }
        out.insert("thinkingConfig".into(), thinking);
    }

    if id.contains("gpt-5") && !id.contains("gpt-5-chat") {
        if !id.contains("gpt-5-pro") {
            out.insert("reasoningEffort".into(), json!("medium"));
        }
        if id.contains("gpt-5.") && !id.contains("codex") && model.family != BackendFamily::Azure {
            out.insert("textVerbosity".into(), json!("low"));
        }
        if backend.starts_with("opencode") {
            out.insert("promptCacheKey".into(), json!(session_id));
            out.insert("include".into(), json!(["reasoning.encrypted_content"]));
            out.insert("reasoningSummary".into(), json!("auto"));
        }
    }

    if backend == "venice" {
        out.insert("promptCacheKey".into(), json!(session_id));
    }

    out
}

/// Options for cheap background calls: as little reasoning as the model allows.
pub fn small_options(model: &ModelDescriptor) -> OptionBag {
    let id = model.api_id();
    let value = match model.family {
        BackendFamily::OpenAi | BackendFamily::Azure | BackendFamily::Copilot if id.contains("gpt-5") => {
            if id.contains("5.") {
                json!({"reasoningEffort": "low"})
            } else {
                json!({"reasoningEffort": "minimal"})
            }
        }
        BackendFamily::Google | BackendFamily::GoogleVertex => {
            if id.contains("gemini-3") {
                json!({"thinkingConfig": {"thinkingLevel": "minimal"}})
            } else {
                json!({"thinkingConfig": {"thinkingBudget": 0}})
            }
        }
        BackendFamily::OpenRouter => json!({"reasoning": {"enabled": false}}),
        _ => return OptionBag::new(),
    };
    into_bag(value).unwrap_or_default()
}

fn into_bag(value: Value) -> Option<OptionBag> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
