use crate::model::BackendFamily;
use crate::types::OptionBag;

/// Keys the agent runtime puts in the option bag for its own use.
const INTERNAL_KEYS: &[&str] = &["agent", "agentMetadata", "persona", "skill", "setCacheKey", "mode"];

/// Remove runtime-only metadata. Keys with a leading `_` are internal too.
pub fn strip_internal(options: &OptionBag) -> OptionBag {
    options
        .iter()
        .filter(|(k, _)| !k.starts_with('_') && !INTERNAL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Option keys a family accepts. `None` means no table: everything passes.
pub fn allowlist(family: BackendFamily) -> Option<&'static [&'static str]> {
    let keys: &'static [&'static str] = match family {
        BackendFamily::OpenAi | BackendFamily::Azure => &[
            "reasoningEffort",
            "reasoningSummary",
            "include",
            "promptCacheKey",
            "textVerbosity",
            "store",
            "user",
            "parallelToolCalls",
            "serviceTier",
            "metadata",
        ],
        BackendFamily::Anthropic => &["thinking", "cacheControl", "sendReasoning", "disableParallelToolUse", "effort"],
        BackendFamily::Bedrock => &["reasoningConfig", "cachePoint", "additionalModelRequestFields"],
        BackendFamily::Google | BackendFamily::GoogleVertex => &[
            "thinkingConfig",
            "safetySettings",
            "cachedContent",
            "responseModalities",
            "structuredOutputs",
            "audioTimestamp",
        ],
        BackendFamily::OpenRouter => &["reasoning", "usage", "provider", "models", "transforms", "plugins"],
        BackendFamily::Mistral => &["safePrompt", "parallelToolCalls", "documentImageLimit", "documentPageLimit"],
        BackendFamily::Xai => &["reasoningEffort", "searchParameters"],
        BackendFamily::Copilot => &["reasoningEffort", "reasoningSummary", "include", "thinking_budget"],
        BackendFamily::OpenAiCompatible | BackendFamily::Gateway | BackendFamily::Other => return None,
    };
    Some(keys)
}

/// Drop keys the family does not accept.
pub fn filter_bundle(family: BackendFamily, bundle: OptionBag) -> OptionBag {
    let Some(allowed) = allowlist(family) else {
        return bundle;
    };
    bundle
        .into_iter()
        .filter(|(k, _)| {
            let keep = allowed.contains(&k.as_str());
            if !keep {
                tracing::debug!("Dropping option '{}' not accepted by {:?}", k, family);
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(v: serde_json::Value) -> OptionBag {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_strip_internal() {
        let opts = bag(json!({"agent": "build", "_trace": 1, "mode": "plan", "store": false}));
        let out = strip_internal(&opts);
        assert_eq!(out, bag(json!({"store": false})));
        // Input untouched
        assert_eq!(opts.len(), 4);
    }

    #[test]
    fn test_filter_bundle() {
        let b = bag(json!({"thinking": {"type": "enabled"}, "reasoningEffort": "high"}));
        let out = filter_bundle(BackendFamily::Anthropic, b.clone());
        assert_eq!(out, bag(json!({"thinking": {"type": "enabled"}})));

        let out = filter_bundle(BackendFamily::OpenAi, b.clone());
        assert_eq!(out, bag(json!({"reasoningEffort": "high"})));

        // No table: pass through
        assert_eq!(filter_bundle(BackendFamily::OpenAiCompatible, b.clone()), b);
    }

    #[test]
    fn test_allowlist_coverage() {
        assert!(allowlist(BackendFamily::Mistral).unwrap().contains(&"safePrompt"));
        assert!(allowlist(BackendFamily::GoogleVertex).unwrap().contains(&"thinkingConfig"));
        assert!(allowlist(BackendFamily::Gateway).is_none());
    }
}
