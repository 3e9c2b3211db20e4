use serde::{Deserialize, Serialize};

/// A named group of interchangeable models, most preferred first.
///
/// Patterns are `backend/model` or bare model ids. A trailing `*` makes a
/// pattern a prefix match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Tier {
    pub fn new(name: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

pub const FLAGSHIP: &str = "flagship";
pub const STANDARD: &str = "standard";
pub const FAST: &str = "fast";
pub const MINI: &str = "mini";

/// Built-in table, highest capability first.
pub fn builtin_tiers() -> Vec<Tier> {
    vec![
        Tier::new(
            FLAGSHIP,
            &[
                "anthropic/claude-opus-4-5",
                "anthropic/claude-opus-4-1",
                "anthropic/claude-opus-4",
                "openai/gpt-5.2",
                "openai/gpt-5.1",
                "openai/gpt-5",
                "google/gemini-3-pro-preview",
                "google/gemini-2.5-pro",
                "xai/grok-4",
            ],
        ),
        Tier::new(
            STANDARD,
            &[
                "anthropic/claude-sonnet-4-5",
                "anthropic/claude-sonnet-4",
                "anthropic/claude-3-7-sonnet",
                "openai/gpt-4.1",
                "openai/gpt-4o",
                "deepseek/deepseek-chat",
                "moonshot/kimi-k2*",
                "zai/glm-4.6",
                "mistral/mistral-large*",
                "xai/grok-3",
            ],
        ),
        Tier::new(
            FAST,
            &[
                "anthropic/claude-haiku-4-5",
                "anthropic/claude-3-5-haiku",
                "openai/gpt-5-mini",
                "openai/o4-mini",
                "google/gemini-2.5-flash",
                "google/gemini-2.0-flash",
                "groq/llama-3.3-70b-versatile",
                "xai/grok-3-mini",
            ],
        ),
        Tier::new(
            MINI,
            &[
                "openai/gpt-5-nano",
                "openai/gpt-4.1-nano",
                "openai/gpt-4o-mini",
                "openai/gpt-4.1-mini",
                "google/gemini-2.5-flash-lite",
                "google/gemini-2.0-flash-lite",
                "mistral/ministral*",
            ],
        ),
    ]
}

/// Canonical form used for table lookups: lowercase, `.` as `-`, no
/// repeated dashes, no trailing `latest`.
pub fn normalize_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.to_lowercase().chars() {
        let c = if c == '.' { '-' } else { c };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    if let Some(stripped) = out.strip_suffix("latest") {
        out.truncate(stripped.len());
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

const FLAGSHIP_WORDS: &[&str] = &["opus", "pro", "ultra", "max", "large"];
const FAST_WORDS: &[&str] = &["haiku", "flash", "mini", "nano", "lite", "small", "fast", "instant"];
const STANDARD_WORDS: &[&str] = &["sonnet", "medium", "plus", "chat", "turbo", "base"];

/// Keyword guess for ids no table lists.
pub fn heuristic_tier(model_id: &str) -> Option<&'static str> {
    let lower = model_id.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(t));

    if has(FLAGSHIP_WORDS) {
        Some(FLAGSHIP)
    } else if has(FAST_WORDS) {
        Some(FAST)
    } else if has(STANDARD_WORDS) {
        Some(STANDARD)
    } else {
        None
    }
}
