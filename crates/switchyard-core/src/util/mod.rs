pub mod http;

use serde_json::Value;

use crate::types::OptionBag;

/// Recursively merge `other` into `target`. Objects merge key by key;
/// anything else in `other` replaces the value in `target`.
pub fn deep_merge(target: &mut Value, other: &Value) {
    match (target, other) {
        (Value::Object(dst), Value::Object(src)) => merge_bags(dst, src),
        (dst, src) => *dst = src.clone(),
    }
}

/// `deep_merge` for two option bags.
pub fn merge_bags(target: &mut OptionBag, other: &OptionBag) {
    for (key, value) in other {
        match target.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Truncate a string to max length, adding suffix if truncated.
pub fn truncate_string(s: &str, max_len: usize, suffix: &str) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(suffix.len());
    // Ensure we don't split a multi-byte UTF-8 character
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_nested() {
        let mut a = json!({"anthropic": {"thinking": {"type": "enabled"}, "x": 1}});
        let b = json!({"anthropic": {"thinking": {"budgetTokens": 16000}}, "openai": {"store": false}});
        deep_merge(&mut a, &b);
        assert_eq!(
            a,
            json!({
                "anthropic": {"thinking": {"type": "enabled", "budgetTokens": 16000}, "x": 1},
                "openai": {"store": false}
            })
        );
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_arrays() {
        let mut a = json!({"include": ["a"], "n": 1});
        deep_merge(&mut a, &json!({"include": ["b"], "n": {"k": true}}));
        assert_eq!(a, json!({"include": ["b"], "n": {"k": true}}));
    }

    #[test]
    fn test_deep_merge_idempotent() {
        let patch = json!({"cacheControl": {"type": "ephemeral"}});
        let mut a = json!({});
        deep_merge(&mut a, &patch);
        let once = a.clone();
        deep_merge(&mut a, &patch);
        assert_eq!(a, once);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10, "..."), "hello");
        assert_eq!(truncate_string("hello world", 8, "..."), "hello...");
        assert_eq!(truncate_string("ab", 2, "..."), "ab");
    }
}
