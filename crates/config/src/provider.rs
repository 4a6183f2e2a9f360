//! Upstream provider configuration.

use std::{collections::BTreeMap, path::PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Wire protocol spoken by an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI chat completions.
    Openai,
    /// Anthropic messages.
    Anthropic,
    /// Google Gemini generateContent.
    Gemini,
    /// Google Vertex AI, Gemini or Anthropic publisher models.
    Vertex,
    /// OpenAI Responses API.
    Responses,
    /// Any OpenAI-compatible endpoint with a configurable path.
    Custom,
}

impl ProviderKind {
    /// Default API base for the provider kind, if it has a well-known one.
    pub fn default_api_base(self) -> Option<&'static str> {
        match self {
            ProviderKind::Openai | ProviderKind::Responses => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
            ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderKind::Vertex | ProviderKind::Custom => None,
        }
    }
}

/// Configuration of a single upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Wire protocol of the provider.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Base URL. Defaults to the provider kind's public API.
    #[serde(default)]
    pub api_base: Option<Url>,
    /// API key sent upstream.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Relative selection weight, at least 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Disabled providers are never selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ordered model rename rules. Empty means every model is served unchanged.
    #[serde(default)]
    pub model_mapping: Vec<ModelRule>,
    /// Extra headers sent with every upstream request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Path of a transform script overriding the built-in converters.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Request path for `custom` providers, relative to `api_base`.
    #[serde(default)]
    pub path: Option<String>,
    /// Vertex AI project settings.
    #[serde(default)]
    pub vertex: Option<VertexConfig>,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// The effective API base, falling back to the kind's default.
    pub fn base_url(&self) -> Option<String> {
        if let Some(url) = &self.api_base {
            return Some(url.as_str().trim_end_matches('/').to_string());
        }

        if let Some(vertex) = &self.vertex {
            return Some(format!("https://{}-aiplatform.googleapis.com/v1", vertex.location));
        }

        self.kind.default_api_base().map(str::to_string)
    }
}

/// Vertex AI addressing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VertexConfig {
    /// Google Cloud project id.
    pub project: String,
    /// Region, e.g. `us-central1`.
    pub location: String,
    /// Model publisher, selecting the wire format.
    #[serde(default)]
    pub publisher: VertexPublisher,
}

/// Publisher of a Vertex AI model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexPublisher {
    /// Gemini models, generateContent format.
    #[default]
    Google,
    /// Claude models, Anthropic messages format.
    Anthropic,
}

/// One model rename rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRule {
    /// Requested model name, glob pattern or regex.
    pub from: String,
    /// Model name sent upstream.
    pub to: String,
    /// How `from` is matched. Inferred when omitted: a `*` or `?` makes it a wildcard.
    #[serde(default, rename = "match")]
    pub match_kind: Option<MatchKind>,
}

impl ModelRule {
    /// The effective match kind of the rule.
    pub fn kind(&self) -> MatchKind {
        match self.match_kind {
            Some(kind) => kind,
            None if self.from.contains(['*', '?']) => MatchKind::Wildcard,
            None => MatchKind::Exact,
        }
    }
}

/// Matching strategy of a [`ModelRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Byte-for-byte equality.
    Exact,
    /// Glob with `*` and `?`.
    Wildcard,
    /// Regular expression, anchored at both ends.
    Regex,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use crate::{Config, MatchKind};

    #[test]
    fn provider_with_mapping() {
        let config = indoc! {r#"
            [providers.openai-main]
            type = "openai"
            api_key = "sk-test"
            weight = 2
            model_mapping = [
                { from = "gpt-4", to = "gpt-4-turbo" },
                { from = "gpt-*", to = "gpt-fallback" },
                { from = "^o[0-9]+$", to = "o3", match = "regex" },
            ]
            headers = { "x-team" = "platform" }
        "#};

        let config: Config = toml::from_str(config).unwrap();
        let provider = &config.providers["openai-main"];

        let kinds: Vec<_> = provider.model_mapping.iter().map(|rule| rule.kind()).collect();
        assert_eq!(kinds, vec![MatchKind::Exact, MatchKind::Wildcard, MatchKind::Regex]);
        assert_eq!(provider.weight, 2);
        assert!(provider.enabled);
        assert_eq!(provider.base_url().as_deref(), Some("https://api.openai.com/v1"));

        assert_debug_snapshot!(&provider.headers, @r#"
        {
            "x-team": "platform",
        }
        "#);
    }

    #[test]
    fn vertex_provider() {
        let config = indoc! {r#"
            [providers.vertex-claude]
            type = "vertex"
            api_key = "ya29.token"

            [providers.vertex-claude.vertex]
            project = "acme"
            location = "europe-west1"
            publisher = "anthropic"
        "#};

        let config: Config = toml::from_str(config).unwrap();
        let provider = &config.providers["vertex-claude"];

        assert_eq!(
            provider.base_url().as_deref(),
            Some("https://europe-west1-aiplatform.googleapis.com/v1")
        );

        assert_debug_snapshot!(&provider.vertex, @r#"
        Some(
            VertexConfig {
                project: "acme",
                location: "europe-west1",
                publisher: Anthropic,
            },
        )
        "#);
    }

    #[test]
    fn custom_base_url_has_no_trailing_slash() {
        let config = indoc! {r#"
            [providers.local]
            type = "custom"
            api_base = "http://localhost:11434/v1/"
            path = "/chat/completions"
        "#};

        let config: Config = toml::from_str(config).unwrap();

        assert_eq!(
            config.providers["local"].base_url().as_deref(),
            Some("http://localhost:11434/v1")
        );
    }

    #[test]
    fn unknown_provider_type() {
        let config = indoc! {r#"
            [providers.bedrock]
            type = "bedrock"
        "#};

        let error = toml::from_str::<Config>(config).unwrap_err();
        assert!(error.to_string().contains("unknown variant `bedrock`"));
    }
}
