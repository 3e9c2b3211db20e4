//! Which models can stand in for which.

pub mod tiers;

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::model::ModelRef;
use crate::provider::ModelRegistry;

pub use tiers::{builtin_tiers, heuristic_tier, normalize_id, Tier};

/// Where a model landed in the tier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    tier: usize,
    /// Position of the matching pattern; `usize::MAX` for keyword guesses.
    pattern: usize,
}

/// Maps models to capability tiers and finds substitutes across backends.
pub struct EquivalenceResolver {
    table: RwLock<Arc<Vec<Tier>>>,
    registry: Arc<dyn ModelRegistry>,
}

impl EquivalenceResolver {
    pub fn new(registry: Arc<dyn ModelRegistry>) -> Self {
        Self {
            table: RwLock::new(Arc::new(builtin_tiers())),
            registry,
        }
    }

    /// Current table, most capable tier first.
    pub fn tiers(&self) -> Arc<Vec<Tier>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the table. Built-in tiers not named in `custom` keep their
    /// defaults; new names are appended after them.
    pub fn configure(&self, custom: Vec<Tier>) {
        let mut table = builtin_tiers();
        for tier in custom {
            match table.iter_mut().find(|t| t.name == tier.name) {
                Some(existing) => existing.patterns = tier.patterns,
                None => table.push(tier),
            }
        }
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    /// Restore the built-in table.
    pub fn reset(&self) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(builtin_tiers());
    }

    /// Tier of `model`. Table patterns always win over keyword guesses.
    pub fn get_tier(&self, model: &ModelRef) -> Option<Tier> {
        let table = self.tiers();
        place(&table, model).map(|p| table[p.tier].clone())
    }

    /// First registered, available model equivalent to `model`.
    ///
    /// Searches `model`'s tier and then each lower tier. Within a tier,
    /// models on `preferred` backends come first in preference order, then
    /// table order, then registry order. Backends in `exclude` are skipped.
    pub async fn find_fallback(
        &self,
        model: &ModelRef,
        exclude: &[String],
        preferred: &[String],
    ) -> Option<ModelRef> {
        let table = self.tiers();
        let start = place(&table, model)?.tier;
        let backends = self.registry.list().await;

        for tier_idx in start..table.len() {
            let mut candidates: Vec<((usize, usize, usize, usize), ModelRef)> = Vec::new();
            for (backend_pos, backend) in backends.iter().enumerate() {
                if exclude.iter().any(|e| e == &backend.id) {
                    continue;
                }
                let pref = preferred
                    .iter()
                    .position(|p| p == &backend.id)
                    .unwrap_or(usize::MAX);
                for (model_pos, model_id) in backend.models.iter().enumerate() {
                    let candidate = ModelRef::new(&backend.id, model_id);
                    if candidate == *model {
                        continue;
                    }
                    match place(&table, &candidate) {
                        Some(p) if p.tier == tier_idx => {
                            candidates.push(((pref, p.pattern, backend_pos, model_pos), candidate));
                        }
                        _ => {}
                    }
                }
            }
            candidates.sort_by(|a, b| a.0.cmp(&b.0));

            for (_, candidate) in candidates {
                match self
                    .registry
                    .get_model(&candidate.backend_id, &candidate.model_id)
                    .await
                {
                    Ok(_) => {
                        debug!("Fallback for {} is {} (tier {})", model, candidate, table[tier_idx].name);
                        return Some(candidate);
                    }
                    Err(e) => debug!("Skipping fallback candidate {}: {}", candidate, e),
                }
            }
        }
        None
    }
}

fn place(table: &[Tier], model: &ModelRef) -> Option<Placement> {
    let full = normalize_id(&model.to_string());
    let id = normalize_id(&model.model_id);
    let last_segment = id.rsplit('/').next().unwrap_or(&id).to_string();
    let subjects = |pattern: &str| subjects_for(pattern, &full, &id, &last_segment);

    // Exact matches anywhere beat prefix matches.
    for (tier, t) in table.iter().enumerate() {
        for (pattern, raw) in t.patterns.iter().enumerate() {
            let p = normalize_id(raw);
            if p.ends_with('*') {
                continue;
            }
            if subjects(&p).iter().any(|s| *s == p) {
                return Some(Placement { tier, pattern });
            }
        }
    }

    // Longest prefix next; ties keep the earliest position.
    let mut best: Option<(usize, Placement)> = None;
    for (tier, t) in table.iter().enumerate() {
        for (pattern, raw) in t.patterns.iter().enumerate() {
            let p = normalize_id(raw);
            let len = subjects(&p)
                .iter()
                .filter_map(|s| prefix_len(&p, s))
                .max();
            if let Some(len) = len {
                if best.map_or(true, |(l, _)| len > l) {
                    best = Some((len, Placement { tier, pattern }));
                }
            }
        }
    }
    if let Some((_, placement)) = best {
        return Some(placement);
    }

    let guess = heuristic_tier(&model.model_id)?;
    table
        .iter()
        .position(|t| t.name == guess)
        .map(|tier| Placement {
            tier,
            pattern: usize::MAX,
        })
}

/// Strings a pattern is compared against. Qualified patterns see the full
/// reference and the model id; bare ones see the model id and its last
/// path segment.
fn subjects_for<'a>(pattern: &str, full: &'a str, id: &'a str, last: &'a str) -> [&'a str; 2] {
    if pattern.contains('/') {
        [full, id]
    } else {
        [id, last]
    }
}

/// Length of `pattern` when it is a prefix of `subject`: either a `*`
/// wildcard or a whole dash-separated leading segment.
fn prefix_len(pattern: &str, subject: &str) -> Option<usize> {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return subject.starts_with(prefix).then_some(prefix.len());
    }
    let rest = subject.strip_prefix(pattern)?;
    rest.starts_with('-').then_some(pattern.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendFamily, ModelDescriptor};
    use crate::provider::StaticRegistry;

    fn r(s: &str) -> ModelRef {
        ModelRef::parse(s).unwrap()
    }

    fn resolver(models: &[(&str, &str)]) -> EquivalenceResolver {
        let registry = StaticRegistry::with_models(
            models
                .iter()
                .map(|(b, m)| ModelDescriptor::new(*b, *m, BackendFamily::Other)),
        );
        EquivalenceResolver::new(Arc::new(registry))
    }

    #[test]
    fn test_get_tier_explicit() {
        let res = resolver(&[]);
        assert_eq!(res.get_tier(&r("anthropic/claude-opus-4-5")).unwrap().name, "flagship");
        assert_eq!(res.get_tier(&r("anthropic/claude-opus-4.5")).unwrap().name, "flagship");
        assert_eq!(res.get_tier(&r("openrouter/anthropic/claude-opus-4.5")).unwrap().name, "flagship");
        assert_eq!(res.get_tier(&r("openai/gpt-5-mini")).unwrap().name, "fast");
        assert_eq!(res.get_tier(&r("openai/gpt-4o-mini")).unwrap().name, "mini");
        assert_eq!(res.get_tier(&r("moonshot/kimi-k2-0905")).unwrap().name, "standard");
        assert_eq!(res.get_tier(&r("anthropic/claude-3-5-haiku-latest")).unwrap().name, "fast");
    }

    #[test]
    fn test_get_tier_longest_prefix() {
        let res = resolver(&[]);
        // Dated snapshot of a mini model, not the flagship it shares a prefix with
        assert_eq!(res.get_tier(&r("openai/gpt-5-mini-2025-08-07")).unwrap().name, "fast");
        assert_eq!(res.get_tier(&r("anthropic/claude-sonnet-4-5-20250929")).unwrap().name, "standard");
    }

    #[test]
    fn test_get_tier_match_precedence() {
        let res = resolver(&[]);
        res.configure(vec![
            Tier::new("alpha", &["acme/m1"]),
            Tier::new("beta", &["acme/m1*"]),
            Tier::new("gamma", &["acme/m1-large", "acme/m1-large-2"]),
        ]);
        // Equal-length prefixes: earliest tier wins
        assert_eq!(res.get_tier(&r("acme/m1-small")).unwrap().name, "alpha");
        // Longer prefix wins even in a later tier
        assert_eq!(res.get_tier(&r("acme/m1-large-3")).unwrap().name, "gamma");
        // Exact match in a later tier beats any prefix
        assert_eq!(res.get_tier(&r("acme/m1-large-2")).unwrap().name, "gamma");
        assert_eq!(res.get_tier(&r("acme/m1")).unwrap().name, "alpha");
    }

    #[test]
    fn test_get_tier_heuristic() {
        let res = resolver(&[]);
        assert_eq!(res.get_tier(&r("unknown-vendor/some-model-pro")).unwrap().name, "flagship");
        assert_eq!(res.get_tier(&r("acme/turbo-9")).unwrap().name, "standard");
        assert!(res.get_tier(&r("acme/mystery")).is_none());
    }

    #[test]
    fn test_explicit_beats_heuristic() {
        let res = resolver(&[]);
        // "flash" keyword would say fast, "lite" too; table says mini
        assert_eq!(res.get_tier(&r("google/gemini-2.5-flash-lite")).unwrap().name, "mini");
        // "pro" keyword says flagship; table agrees
        assert_eq!(res.get_tier(&r("google/gemini-2.5-pro")).unwrap().name, "flagship");
    }

    #[test]
    fn test_configure_and_reset() {
        let res = resolver(&[]);
        res.configure(vec![
            Tier::new("flagship", &["acme/big"]),
            Tier::new("local", &["ollama/*"]),
        ]);
        let tiers = res.tiers();
        assert_eq!(tiers.len(), 5);
        assert_eq!(tiers[0].patterns, vec!["acme/big"]);
        assert_eq!(tiers[1].name, "standard");
        assert_eq!(res.get_tier(&r("ollama/qwen3")).unwrap().name, "local");
        // Opus is no longer listed, but the keyword still places it
        assert_eq!(res.get_tier(&r("anthropic/claude-opus-4-5")).unwrap().name, "flagship");

        res.reset();
        assert_eq!(res.tiers().len(), 4);
        assert!(res.get_tier(&r("ollama/qwen3")).is_none());
    }

    #[tokio::test]
    async fn test_find_fallback_same_tier_first() {
        let res = resolver(&[
            ("anthropic", "claude-opus-4-5"),
            ("anthropic", "claude-sonnet-4-5"),
            ("openai", "gpt-4o"),
            ("openai", "gpt-5"),
            ("google", "gemini-2.5-pro"),
        ]);
        let fb = res
            .find_fallback(&r("anthropic/claude-opus-4-5"), &["anthropic".into()], &[])
            .await;
        assert_eq!(fb, Some(r("openai/gpt-5")));
    }

    #[tokio::test]
    async fn test_find_fallback_preferred_backend() {
        let res = resolver(&[
            ("anthropic", "claude-opus-4-5"),
            ("openai", "gpt-5"),
            ("google", "gemini-2.5-pro"),
        ]);
        let fb = res
            .find_fallback(&r("anthropic/claude-opus-4-5"), &["anthropic".into()], &["google".into()])
            .await;
        assert_eq!(fb, Some(r("google/gemini-2.5-pro")));
    }

    #[tokio::test]
    async fn test_find_fallback_descends_tiers() {
        let res = resolver(&[("anthropic", "claude-opus-4-5"), ("openai", "gpt-4o-mini"), ("openai", "gpt-4o")]);
        let fb = res
            .find_fallback(&r("anthropic/claude-opus-4-5"), &["anthropic".into()], &[])
            .await;
        assert_eq!(fb, Some(r("openai/gpt-4o")));
    }

    #[tokio::test]
    async fn test_find_fallback_respects_exclusion() {
        let res = resolver(&[("anthropic", "claude-opus-4-5"), ("openai", "gpt-5")]);
        let fb = res
            .find_fallback(
                &r("anthropic/claude-opus-4-5"),
                &["anthropic".into(), "openai".into()],
                &[],
            )
            .await;
        assert_eq!(fb, None);
    }

    #[tokio::test]
    async fn test_find_fallback_same_backend_sibling() {
        let res = resolver(&[("anthropic", "claude-opus-4-5"), ("anthropic", "claude-opus-4-1")]);
        let fb = res.find_fallback(&r("anthropic/claude-opus-4-5"), &[], &[]).await;
        assert_eq!(fb, Some(r("anthropic/claude-opus-4-1")));
    }

    #[tokio::test]
    async fn test_find_fallback_unknown_tier() {
        let res = resolver(&[("openai", "gpt-5")]);
        assert_eq!(res.find_fallback(&r("acme/mystery"), &[], &[]).await, None);
    }
}
