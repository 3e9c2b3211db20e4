use serde::{Deserialize, Serialize};

/// A `(backend, model)` pair addressing one completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub backend_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(backend_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Split a canonical `"backend/model"` string on the first separator.
    /// The model part may itself contain `/` (`openrouter/anthropic/claude-opus-4.5`).
    pub fn parse(s: &str) -> Option<Self> {
        let (backend, model) = s.split_once('/')?;
        if backend.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(backend, model))
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend_id, self.model_id)
    }
}

impl std::str::FromStr for ModelRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid model reference '{s}', expected backend/model"))
    }
}

/// Client family a backend speaks. Determines the request dialect, the
/// option-bundle key, and which parameters the backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendFamily {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Azure,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "openrouter")]
    OpenRouter,
    Google,
    GoogleVertex,
    Bedrock,
    Mistral,
    Xai,
    Gateway,
    Copilot,
    #[serde(other)]
    Other,
}

impl BackendFamily {
    /// Shared option-bundle key for families whose client does not key
    /// options by the backend id.
    pub fn sdk_key(self) -> Option<&'static str> {
        match self {
            BackendFamily::Copilot => Some("copilot"),
            BackendFamily::OpenAi | BackendFamily::Azure => Some("openai"),
            BackendFamily::Bedrock => Some("bedrock"),
            BackendFamily::Anthropic => Some("anthropic"),
            BackendFamily::Google | BackendFamily::GoogleVertex => Some("google"),
            BackendFamily::Gateway => Some("gateway"),
            BackendFamily::OpenRouter => Some("openrouter"),
            BackendFamily::OpenAiCompatible
            | BackendFamily::Mistral
            | BackendFamily::Xai
            | BackendFamily::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Modalities {
    pub text: bool,
    pub image: bool,
    pub pdf: bool,
    pub audio: bool,
    pub video: bool,
}

impl Default for Modalities {
    fn default() -> Self {
        Self {
            text: true,
            image: false,
            pdf: false,
            audio: false,
            video: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelCapabilities {
    pub reasoning: bool,
    pub temperature: bool,
    pub tool_call: bool,
    /// Message field that must carry reasoning on every assistant turn
    /// (`reasoning_content`, `reasoning_details`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interleaved: Option<String>,
    pub input: Modalities,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            reasoning: false,
            temperature: true,
            tool_call: true,
            interleaved: None,
            input: Modalities::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelLimit {
    pub context: u32,
    /// Hard output cap; 0 when unknown.
    pub output: u32,
}

/// Everything the normalizer needs to know about a target model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub backend_id: String,
    pub family: BackendFamily,
    /// `YYYY-MM-DD`, compared lexically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub limit: ModelLimit,
}

impl ModelDescriptor {
    pub fn new(backend_id: impl Into<String>, id: impl Into<String>, family: BackendFamily) -> Self {
        Self {
            id: id.into(),
            backend_id: backend_id.into(),
            family,
            release_date: None,
            capabilities: ModelCapabilities::default(),
            limit: ModelLimit::default(),
        }
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(&self.backend_id, &self.id)
    }

    /// Lowercased model id, the key for all substring-driven tables.
    pub fn api_id(&self) -> String {
        self.id.to_lowercase()
    }

    pub fn released_on_or_after(&self, date: &str) -> bool {
        self.release_date.as_deref().is_some_and(|d| d >= date)
    }

    /// Option-bundle key this model's client expects.
    pub fn options_key(&self) -> String {
        self.family
            .sdk_key()
            .map(str::to_string)
            .unwrap_or_else(|| self.backend_id.clone())
    }

    pub fn is_claude(&self) -> bool {
        let id = self.api_id();
        self.family == BackendFamily::Anthropic || id.contains("claude") || id.contains("anthropic")
    }

    pub fn is_gemini(&self) -> bool {
        matches!(self.family, BackendFamily::Google | BackendFamily::GoogleVertex)
            || self.api_id().contains("gemini")
    }

    pub fn is_mistral(&self) -> bool {
        let id = self.api_id();
        self.family == BackendFamily::Mistral || id.contains("mistral") || id.contains("devstral")
    }
}
