//! Translation of the unified request into what one backend family accepts.
//!
//! Every step is a pure function over owned copies; the caller's request
//! is never touched. Running [`normalize`] twice on the same input yields
//! the same output.

pub mod budget;
pub mod messages;
pub mod params;
pub mod reasoning;
pub mod sampling;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::OUTPUT_TOKEN_MAX;
use crate::model::ModelDescriptor;
use crate::types::{CompletionRequest, Message, OptionBag, ToolDefinition};
use crate::util::merge_bags;

pub use reasoning::ReasoningEffort;

/// Per-call knobs that are not part of the request itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizeOptions {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Background/small-model call: minimise reasoning instead of applying
    /// the family defaults.
    pub small: bool,
    pub output_token_max: u32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            reasoning_effort: None,
            small: false,
            output_token_max: OUTPUT_TOKEN_MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Request in the target backend's dialect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizedRequest {
    pub messages: Vec<Message>,
    pub params: SamplingParams,
    /// Option bundle keyed by the family's SDK name (`{"anthropic": {...}}`).
    pub provider_options: OptionBag,
    pub tools: Vec<ToolDefinition>,
}

impl NormalizedRequest {
    /// The option bundle for `key`, empty when absent.
    pub fn bundle(&self, key: &str) -> OptionBag {
        match self.provider_options.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => OptionBag::new(),
        }
    }
}

/// Produce the request `model` should receive.
pub fn normalize(
    request: &CompletionRequest,
    model: &ModelDescriptor,
    opts: &NormalizeOptions,
) -> NormalizedRequest {
    let messages = messages::normalize_messages(&request.messages, model);

    let mut bundle = if opts.small {
        reasoning::small_options(model)
    } else {
        reasoning::default_options(model, &opts.session_id, &request.options)
    };
    if let Some(effort) = opts.reasoning_effort {
        if let Some(variant) = reasoning::variant(model, effort) {
            merge_bags(&mut bundle, &variant);
        }
    }
    merge_bags(&mut bundle, &params::strip_internal(&request.options));
    let bundle = params::filter_bundle(model.family, bundle);

    let mut knobs = SamplingParams::default();
    if model.capabilities.temperature {
        knobs.temperature = request.temperature.or_else(|| sampling::temperature(model));
        knobs.top_p = request.top_p.or_else(|| sampling::top_p(model));
        knobs.top_k = sampling::top_k(model);
    }
    knobs.max_output_tokens =
        budget::max_output_tokens(model, &bundle, opts.output_token_max, request.max_output_tokens);

    let mut provider_options = OptionBag::new();
    if !bundle.is_empty() {
        provider_options.insert(model.options_key(), Value::Object(bundle));
    }

    let tools = request
        .tools
        .iter()
        .map(|tool| {
            if model.is_gemini() {
                ToolDefinition {
                    parameters: schema::sanitize_gemini_schema(&tool.parameters),
                    ..tool.clone()
                }
            } else {
                tool.clone()
            }
        })
        .collect();

    NormalizedRequest {
        messages,
        params: knobs,
        provider_options,
        tools,
    }
}
