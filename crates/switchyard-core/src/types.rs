use serde::{Deserialize, Serialize};

/// Free-form option bag. Backed by `serde_json::Map` so iteration and
/// serialization order are deterministic.
pub type OptionBag = serde_json::Map<String, serde_json::Value>;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Reason the LLM stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    Reasoning {
        text: String,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    Image {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: serde_json::Value,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        output: serde_json::Value,
        #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
        provider_options: OptionBag,
    },
    /// Agent-side permission prompt. Never understood by a backend.
    ToolApprovalRequest {
        #[serde(rename = "approvalId")]
        approval_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
    ToolApprovalResponse {
        #[serde(rename = "approvalId")]
        approval_id: String,
        approved: bool,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            provider_options: OptionBag::new(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Part::Reasoning {
            text: text.into(),
            provider_options: OptionBag::new(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Part::ToolCall {
            tool_call_id: id.into(),
            tool_name: name.into(),
            input,
            provider_options: OptionBag::new(),
        }
    }

    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, output: serde_json::Value) -> Self {
        Part::ToolResult {
            tool_call_id: id.into(),
            tool_name: name.into(),
            output,
            provider_options: OptionBag::new(),
        }
    }

    /// Per-part provider annotations, for the part kinds that carry them.
    pub fn provider_options_mut(&mut self) -> Option<&mut OptionBag> {
        match self {
            Part::Text { provider_options, .. }
            | Part::Reasoning { provider_options, .. }
            | Part::Image { provider_options, .. }
            | Part::File { provider_options, .. }
            | Part::ToolCall { provider_options, .. }
            | Part::ToolResult { provider_options, .. } => Some(provider_options),
            Part::ToolApprovalRequest { .. } | Part::ToolApprovalResponse { .. } => None,
        }
    }
}

/// Message content: either a bare string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(rename = "providerOptions", default, skip_serializing_if = "OptionBag::is_empty")]
    pub provider_options: OptionBag,
}

impl Message {
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            provider_options: OptionBag::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::Text(content.into()))
    }

    pub fn with_parts(role: Role, parts: Vec<Part>) -> Self {
        Self::new(role, Content::Parts(parts))
    }

    /// Concatenated visible text of the message.
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Unified request shape handed to the resilience layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Caller-supplied backend options (flat bag, backend vocabulary).
    pub options: OptionBag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One element of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCall { id: String, name: String, input: serde_json::Value },
    Finish { reason: FinishReason, usage: TokenUsage },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::System.to_string(), "system");
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(Role::Tool.to_string(), "tool");
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn test_part_tagging() {
        let part = Part::tool_call("call_1", "read", serde_json::json!({"path": "a"}));
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-call");
        assert_eq!(json["toolCallId"], "call_1");
        assert!(json.get("providerOptions").is_none());

        let parsed: Part = serde_json::from_value(serde_json::json!({
            "type": "tool-approval-request",
            "approvalId": "a1",
            "toolCallId": "call_1"
        }))
        .unwrap();
        assert!(matches!(parsed, Part::ToolApprovalRequest { .. }));
    }

    #[test]
    fn test_content_untagged() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.content, Content::Text("hi".into()));

        let msg: Message = serde_json::from_str(
            r#"{"role":"assistant","content":[{"type":"text","text":"a"},{"type":"reasoning","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(msg.text(), "a");
    }

    #[test]
    fn test_stream_event_serde() {
        let ev = StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: TokenUsage::default(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "finish");
        assert_eq!(json["reason"], "tool_calls");
    }
}
