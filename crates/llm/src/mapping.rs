use config::{MatchKind, ModelRule};
use regex::Regex;

use crate::error::LlmError;

/// A compiled model-name matcher.
#[derive(Debug, Clone)]
pub(crate) enum ModelPattern {
    Exact(String),
    Pattern(Regex),
}

impl ModelPattern {
    /// Compiles a name that may contain `*` and `?` wildcards.
    pub fn glob(pattern: &str) -> crate::Result<Self> {
        if !pattern.contains(['*', '?']) {
            return Ok(ModelPattern::Exact(pattern.to_string()));
        }

        let mut source = String::from("^");

        for ch in pattern.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                ch => source.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4]))),
            }
        }

        source.push('$');

        Self::compile(&source, pattern)
    }

    /// Compiles a regular expression anchored at both ends.
    pub fn regex(pattern: &str) -> crate::Result<Self> {
        Self::compile(&format!("^(?:{pattern})$"), pattern)
    }

    fn compile(source: &str, original: &str) -> crate::Result<Self> {
        Regex::new(source)
            .map(ModelPattern::Pattern)
            .map_err(|e| LlmError::InvalidRequest(format!("invalid model pattern '{original}': {e}")))
    }

    pub fn matches(&self, model: &str) -> bool {
        match self {
            ModelPattern::Exact(name) => name == model,
            ModelPattern::Pattern(regex) => regex.is_match(model),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, ModelPattern::Exact(_))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: ModelPattern,
    target: String,
}

impl CompiledRule {
    fn apply(&self, model: &str) -> Option<String> {
        match &self.pattern {
            ModelPattern::Exact(name) => (name == model).then(|| self.target.clone()),
            // Regex targets may reference capture groups, e.g. `claude-$1`.
            ModelPattern::Pattern(regex) => {
                let captures = regex.captures(model)?;
                let mut target = String::new();
                captures.expand(&self.target, &mut target);

                Some(target)
            }
        }
    }
}

/// Resolves requested model names to the names a provider serves.
///
/// Exact rules take precedence over wildcard and regex rules. Within each class the first
/// matching rule in configured order wins. An empty mapping serves every model unchanged.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelMapper {
    exact: Vec<CompiledRule>,
    patterns: Vec<CompiledRule>,
}

impl ModelMapper {
    pub fn new(rules: &[ModelRule]) -> crate::Result<Self> {
        let mut mapper = Self::default();

        for rule in rules {
            let pattern = match rule.kind() {
                MatchKind::Exact => ModelPattern::Exact(rule.from.clone()),
                MatchKind::Wildcard => ModelPattern::glob(&rule.from)?,
                MatchKind::Regex => ModelPattern::regex(&rule.from)?,
            };

            let compiled = CompiledRule {
                pattern,
                target: rule.to.clone(),
            };

            if compiled.pattern.is_exact() {
                mapper.exact.push(compiled);
            } else {
                mapper.patterns.push(compiled);
            }
        }

        Ok(mapper)
    }

    pub fn is_pass_through(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// The upstream name for `requested`, or `None` when this provider does not serve it.
    pub fn resolve(&self, requested: &str) -> Option<String> {
        if self.is_pass_through() {
            return Some(requested.to_string());
        }

        self.exact
            .iter()
            .chain(&self.patterns)
            .find_map(|rule| rule.apply(requested))
    }

    /// Client-facing names of the exact rules, for model listings.
    pub fn listed_models(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().filter_map(|rule| match &rule.pattern {
            ModelPattern::Exact(name) => Some(name.as_str()),
            ModelPattern::Pattern(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(from: &str, to: &str) -> ModelRule {
        ModelRule {
            from: from.into(),
            to: to.into(),
            match_kind: None,
        }
    }

    #[test]
    fn exact_rule_beats_earlier_wildcard() {
        let mapper = ModelMapper::new(&[rule("gpt-*", "gpt-fallback"), rule("gpt-4", "gpt-4-turbo")]).unwrap();

        assert_eq!(mapper.resolve("gpt-4").as_deref(), Some("gpt-4-turbo"));
        assert_eq!(mapper.resolve("gpt-3.5").as_deref(), Some("gpt-fallback"));
        assert_eq!(mapper.resolve("claude-3"), None);
    }

    #[test]
    fn first_matching_pattern_wins() {
        let mapper = ModelMapper::new(&[rule("gpt-4*", "first"), rule("gpt-*", "second")]).unwrap();

        assert_eq!(mapper.resolve("gpt-4o").as_deref(), Some("first"));
        assert_eq!(mapper.resolve("gpt-3").as_deref(), Some("second"));
    }

    #[test]
    fn empty_mapping_passes_through() {
        let mapper = ModelMapper::new(&[]).unwrap();

        assert!(mapper.is_pass_through());
        assert_eq!(mapper.resolve("anything").as_deref(), Some("anything"));
    }

    #[test]
    fn regex_rule_expands_captures() {
        let mapper = ModelMapper::new(&[ModelRule {
            from: r"claude-(\d+)-sonnet".into(),
            to: "claude-sonnet-$1-latest".into(),
            match_kind: Some(MatchKind::Regex),
        }])
        .unwrap();

        assert_eq!(mapper.resolve("claude-4-sonnet").as_deref(), Some("claude-sonnet-4-latest"));
        assert_eq!(mapper.resolve("my-claude-4-sonnet"), None);
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let pattern = ModelPattern::glob("gpt-4.?").unwrap();

        assert!(pattern.matches("gpt-4.1"));
        assert!(!pattern.matches("gpt-4x1"));
        assert!(ModelPattern::glob("gpt-4").unwrap().is_exact());
    }

    #[test]
    fn listed_models_are_exact_rules() {
        let mapper = ModelMapper::new(&[rule("fast", "gpt-4o-mini"), rule("gpt-*", "gpt-4o")]).unwrap();

        assert_eq!(mapper.listed_models().collect::<Vec<_>>(), vec!["fast"]);
    }
}
