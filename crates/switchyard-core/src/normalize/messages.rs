use serde_json::{json, Value};

use crate::model::{BackendFamily, ModelCapabilities, ModelDescriptor};
use crate::types::{Content, Message, OptionBag, Part, Role};
use crate::util::merge_bags;

/// Run every message-level step for `model`.
pub fn normalize_messages(messages: &[Message], model: &ModelDescriptor) -> Vec<Message> {
    let mut msgs = strip_approval_parts(messages.to_vec());
    if matches!(model.family, BackendFamily::Anthropic | BackendFamily::Bedrock) {
        msgs = drop_empty_content(msgs);
    }
    msgs = replace_unsupported_media(msgs, &model.capabilities);
    if model.is_claude() {
        msgs = rewrite_tool_ids(msgs, claude_tool_id);
    } else if model.is_mistral() {
        msgs = rewrite_tool_ids(msgs, mistral_tool_id);
        msgs = insert_mistral_ack(msgs);
    }
    if let Some(field) = &model.capabilities.interleaved {
        msgs = carry_interleaved_reasoning(msgs, field);
    }
    msgs = apply_cache_hints(msgs, model);
    remap_option_keys(msgs, model)
}

/// Remove tool approval request/response parts. No backend understands them.
pub fn strip_approval_parts(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|mut msg| {
            if let Content::Parts(parts) = &mut msg.content {
                let before = parts.len();
                parts.retain(|p| {
                    !matches!(p, Part::ToolApprovalRequest { .. } | Part::ToolApprovalResponse { .. })
                });
                if before > 0 && parts.is_empty() {
                    return None;
                }
            }
            Some(msg)
        })
        .collect()
}

/// Drop empty strings and empty text/reasoning parts, then any message left
/// with nothing in it.
pub fn drop_empty_content(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|mut msg| {
            match &mut msg.content {
                Content::Text(text) if text.is_empty() => return None,
                Content::Text(_) => {}
                Content::Parts(parts) => {
                    parts.retain(|p| match p {
                        Part::Text { text, .. } | Part::Reasoning { text, .. } => !text.is_empty(),
                        _ => true,
                    });
                    if parts.is_empty() {
                        return None;
                    }
                }
            }
            Some(msg)
        })
        .collect()
}

/// Swap image/file parts the model cannot read for an explanatory text part.
pub fn replace_unsupported_media(messages: Vec<Message>, caps: &ModelCapabilities) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut msg| {
            if let Content::Parts(parts) = &mut msg.content {
                for part in parts.iter_mut() {
                    let replacement = match part {
                        Part::Image { .. } if !caps.input.image => Some(unsupported_text("image", "image")),
                        Part::File { media_type, filename, .. } => {
                            let modality = modality_of(media_type);
                            if supports(caps, modality) {
                                None
                            } else {
                                let name = filename.clone().unwrap_or_else(|| modality.to_string());
                                Some(unsupported_text(&name, modality))
                            }
                        }
                        _ => None,
                    };
                    if let Some(text) = replacement {
                        *part = Part::text(text);
                    }
                }
            }
            msg
        })
        .collect()
}

fn modality_of(media_type: &str) -> &'static str {
    if media_type.starts_with("image/") {
        "image"
    } else if media_type == "application/pdf" {
        "pdf"
    } else if media_type.starts_with("audio/") {
        "audio"
    } else if media_type.starts_with("video/") {
        "video"
    } else {
        "text"
    }
}

fn supports(caps: &ModelCapabilities, modality: &str) -> bool {
    match modality {
        "image" => caps.input.image,
        "pdf" => caps.input.pdf,
        "audio" => caps.input.audio,
        "video" => caps.input.video,
        _ => caps.input.text,
    }
}

fn unsupported_text(name: &str, modality: &str) -> String {
    format!("ERROR: Cannot read {name} (this model does not support {modality} input). Inform the user.")
}

/// Claude accepts `[a-zA-Z0-9_-]` in tool-call ids.
pub fn claude_tool_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Mistral requires exactly nine alphanumeric characters.
pub fn mistral_tool_id(id: &str) -> String {
    let mut out: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).take(9).collect();
    while out.len() < 9 {
        out.push('0');
    }
    out
}

/// Apply `rewrite` to every tool-call and tool-result id.
pub fn rewrite_tool_ids(messages: Vec<Message>, rewrite: fn(&str) -> String) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut msg| {
            if let Content::Parts(parts) = &mut msg.content {
                for part in parts.iter_mut() {
                    match part {
                        Part::ToolCall { tool_call_id, .. } | Part::ToolResult { tool_call_id, .. } => {
                            *tool_call_id = rewrite(tool_call_id);
                        }
                        _ => {}
                    }
                }
            }
            msg
        })
        .collect()
}

/// Mistral rejects a user turn directly after a tool turn.
pub fn insert_mistral_ack(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(msg) = iter.next() {
        let needs_ack = msg.role == Role::Tool && iter.peek().is_some_and(|next| next.role == Role::User);
        out.push(msg);
        if needs_ack {
            out.push(Message::with_parts(Role::Assistant, vec![Part::text("Done.")]));
        }
    }
    out
}

/// Move reasoning parts of assistant messages into
/// `providerOptions.openaiCompatible[field]`. Every assistant message ends
/// up carrying the field, empty when it had no visible reasoning.
pub fn carry_interleaved_reasoning(messages: Vec<Message>, field: &str) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut msg| {
            if msg.role != Role::Assistant {
                return msg;
            }
            let mut reasoning: Option<String> = None;
            if let Content::Parts(parts) = &mut msg.content {
                parts.retain(|p| match p {
                    Part::Reasoning { text, .. } => {
                        reasoning.get_or_insert_with(String::new).push_str(text);
                        false
                    }
                    _ => true,
                });
            }

            let bundle = msg
                .provider_options
                .entry("openaiCompatible")
                .or_insert_with(|| Value::Object(OptionBag::new()));
            if !bundle.is_object() {
                *bundle = Value::Object(OptionBag::new());
            }
            if let Value::Object(map) = bundle {
                match reasoning {
                    Some(text) => {
                        map.insert(field.to_string(), Value::String(text));
                    }
                    None => {
                        map.entry(field.to_string())
                            .or_insert_with(|| Value::String(String::new()));
                    }
                }
            }
            msg
        })
        .collect()
}

/// Cache annotation for `family`, keyed by its option bundle.
fn cache_hint(family: BackendFamily) -> OptionBag {
    let hint = match family {
        BackendFamily::Anthropic => json!({"anthropic": {"cacheControl": {"type": "ephemeral"}}}),
        BackendFamily::OpenRouter => json!({"openrouter": {"cacheControl": {"type": "ephemeral"}}}),
        BackendFamily::Bedrock => json!({"bedrock": {"cachePoint": {"type": "default"}}}),
        BackendFamily::Copilot => json!({"copilot": {"copilot_cache_control": {"type": "ephemeral"}}}),
        _ => json!({"openaiCompatible": {"cache_control": {"type": "ephemeral"}}}),
    };
    match hint {
        Value::Object(map) => map,
        _ => OptionBag::new(),
    }
}

/// Mark the first two system messages and the last two others as cache
/// breakpoints. Only Claude-class models take hints, and not via a gateway.
pub fn apply_cache_hints(mut messages: Vec<Message>, model: &ModelDescriptor) -> Vec<Message> {
    if !model.is_claude() || model.family == BackendFamily::Gateway {
        return messages;
    }

    let mut targets: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::System)
        .map(|(i, _)| i)
        .take(2)
        .collect();
    let rest: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, _)| i)
        .collect();
    targets.extend(rest.iter().rev().take(2));

    let hint = cache_hint(model.family);
    let on_part = model.family != BackendFamily::Anthropic;
    for idx in targets {
        let msg = &mut messages[idx];
        let target = match &mut msg.content {
            Content::Parts(parts) if on_part && !parts.is_empty() => {
                parts.last_mut().and_then(Part::provider_options_mut)
            }
            _ => None,
        };
        match target {
            Some(options) => merge_bags(options, &hint),
            None => merge_bags(&mut msg.provider_options, &hint),
        }
    }
    messages
}

/// Re-key per-message bundles addressed by backend id to the family's
/// shared SDK key.
pub fn remap_option_keys(messages: Vec<Message>, model: &ModelDescriptor) -> Vec<Message> {
    let Some(sdk_key) = model.family.sdk_key() else {
        return messages;
    };
    if sdk_key == model.backend_id {
        return messages;
    }
    messages
        .into_iter()
        .map(|mut msg| {
            rekey(&mut msg.provider_options, &model.backend_id, sdk_key);
            if let Content::Parts(parts) = &mut msg.content {
                for part in parts.iter_mut() {
                    if let Some(options) = part.provider_options_mut() {
                        rekey(options, &model.backend_id, sdk_key);
                    }
                }
            }
            msg
        })
        .collect()
}

fn rekey(options: &mut OptionBag, from: &str, to: &str) {
    let Some(value) = options.remove(from) else {
        return;
    };
    let mut patch = OptionBag::new();
    patch.insert(to.to_string(), value);
    merge_bags(options, &patch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parts(msg: &Message) -> &Vec<Part> {
        match &msg.content {
            Content::Parts(p) => p,
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn test_strip_approval_parts() {
        let msgs = vec![
            Message::with_parts(
                Role::Assistant,
                vec![
                    Part::text("ok"),
                    Part::ToolApprovalRequest {
                        approval_id: "a".into(),
                        tool_call_id: "c".into(),
                    },
                ],
            ),
            Message::with_parts(
                Role::User,
                vec![Part::ToolApprovalResponse {
                    approval_id: "a".into(),
                    approved: true,
                }],
            ),
        ];
        let out = strip_approval_parts(msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(parts(&out[0]).len(), 1);
    }

    #[test]
    fn test_drop_empty_content() {
        let msgs = vec![
            Message::user(""),
            Message::with_parts(Role::Assistant, vec![Part::text(""), Part::reasoning("")]),
            Message::with_parts(Role::Assistant, vec![Part::text(""), Part::text("x")]),
        ];
        let out = drop_empty_content(msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "x");
    }

    #[test]
    fn test_replace_unsupported_media() {
        let msgs = vec![Message::with_parts(
            Role::User,
            vec![
                Part::Image {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                    provider_options: OptionBag::new(),
                },
                Part::File {
                    media_type: "application/pdf".into(),
                    data: "AAAA".into(),
                    filename: Some("report.pdf".into()),
                    provider_options: OptionBag::new(),
                },
            ],
        )];
        let caps = ModelCapabilities::default();
        let out = replace_unsupported_media(msgs.clone(), &caps);
        let p = parts(&out[0]);
        assert!(matches!(&p[0], Part::Text { text, .. } if text.contains("Cannot read image")));
        assert!(matches!(&p[1], Part::Text { text, .. } if text.contains("Cannot read report.pdf") && text.contains("pdf input")));

        let mut caps = ModelCapabilities::default();
        caps.input.image = true;
        caps.input.pdf = true;
        assert_eq!(replace_unsupported_media(msgs.clone(), &caps), msgs);
    }

    #[test]
    fn test_tool_id_rewriting() {
        assert_eq!(claude_tool_id("call.1:x"), "call_1_x");
        assert_eq!(claude_tool_id("toolu_01-AB"), "toolu_01-AB");
        assert_eq!(mistral_tool_id("call_abc-123456789"), "callabc12");
        assert_eq!(mistral_tool_id("ab"), "ab0000000");
        assert_eq!(mistral_tool_id(&mistral_tool_id("x.y.z")), mistral_tool_id("x.y.z"));
    }

    #[test]
    fn test_mistral_ack_inserted_once() {
        let msgs = vec![
            Message::with_parts(Role::Tool, vec![Part::tool_result("a", "t", json!("r"))]),
            Message::user("next"),
        ];
        let once = insert_mistral_ack(msgs);
        assert_eq!(once.len(), 3);
        assert_eq!(once[1].role, Role::Assistant);
        assert_eq!(once[1].text(), "Done.");
        assert_eq!(insert_mistral_ack(once.clone()), once);
    }

    #[test]
    fn test_interleaved_reasoning() {
        let msgs = vec![
            Message::with_parts(
                Role::Assistant,
                vec![Part::reasoning("step 1. "), Part::text("answer"), Part::reasoning("step 2.")],
            ),
            Message::assistant("plain"),
            Message::user("u"),
        ];
        let out = carry_interleaved_reasoning(msgs, "reasoning_content");
        assert_eq!(parts(&out[0]).len(), 1);
        assert_eq!(out[0].provider_options["openaiCompatible"]["reasoning_content"], "step 1. step 2.");
        assert_eq!(out[1].provider_options["openaiCompatible"]["reasoning_content"], "");
        assert!(out[2].provider_options.is_empty());

        let again = carry_interleaved_reasoning(out.clone(), "reasoning_content");
        assert_eq!(again, out);
    }

    #[test]
    fn test_cache_hints_anthropic_on_message() {
        let model = ModelDescriptor::new("anthropic", "claude-opus-4-5", BackendFamily::Anthropic);
        let msgs = vec![
            Message::system("a"),
            Message::system("b"),
            Message::system("c"),
            Message::user("1"),
            Message::assistant("2"),
            Message::user("3"),
        ];
        let out = apply_cache_hints(msgs, &model);
        let marked: Vec<bool> = out.iter().map(|m| !m.provider_options.is_empty()).collect();
        assert_eq!(marked, vec![true, true, false, false, true, true]);
        assert_eq!(out[0].provider_options["anthropic"]["cacheControl"]["type"], "ephemeral");

        let again = apply_cache_hints(out.clone(), &model);
        assert_eq!(again, out);
    }

    #[test]
    fn test_cache_hints_openrouter_on_last_part() {
        let model = ModelDescriptor::new("openrouter", "anthropic/claude-sonnet-4.5", BackendFamily::OpenRouter);
        let mut first = Part::text("x");
        if let Some(opts) = first.provider_options_mut() {
            opts.insert("openrouter".into(), json!({"reasoning": {"effort": "low"}}));
        }
        let msgs = vec![Message::with_parts(Role::User, vec![Part::text("a"), first])];
        let out = apply_cache_hints(msgs, &model);
        let p = parts(&out[0]);
        assert!(matches!(&p[0], Part::Text { provider_options, .. } if provider_options.is_empty()));
        match &p[1] {
            Part::Text { provider_options, .. } => {
                assert_eq!(provider_options["openrouter"]["cacheControl"]["type"], "ephemeral");
                assert_eq!(provider_options["openrouter"]["reasoning"]["effort"], "low");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out[0].provider_options.is_empty());
    }

    #[test]
    fn test_cache_hints_skip_non_claude_and_gateway() {
        let gpt = ModelDescriptor::new("openai", "gpt-5", BackendFamily::OpenAi);
        let msgs = vec![Message::system("a"), Message::user("b")];
        assert_eq!(apply_cache_hints(msgs.clone(), &gpt), msgs);

        let gw = ModelDescriptor::new("gateway", "anthropic/claude-opus-4.5", BackendFamily::Gateway);
        assert_eq!(apply_cache_hints(msgs.clone(), &gw), msgs);
    }

    #[test]
    fn test_remap_option_keys() {
        let model = ModelDescriptor::new("my-azure", "gpt-5", BackendFamily::Azure);
        let mut msg = Message::user("x");
        msg.provider_options.insert("my-azure".into(), json!({"store": false}));
        msg.provider_options.insert("openai".into(), json!({"user": "u1"}));
        let out = remap_option_keys(vec![msg], &model);
        assert!(!out[0].provider_options.contains_key("my-azure"));
        assert_eq!(out[0].provider_options["openai"], json!({"user": "u1", "store": false}));
    }
}
