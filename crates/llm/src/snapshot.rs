//! Immutable, versioned configuration snapshots.
//!
//! Requests load the current snapshot once and hold the `Arc` until they finish, so a reload
//! never changes the configuration under an in-flight request. Old snapshots are dropped when
//! their last reader is done.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use arc_swap::ArcSwap;
use config::{BreakerConfig, Config, GatewayConfig, ProviderConfig, ProviderKind, RateLimitConfig, VertexConfig};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use secrecy::SecretString;
use sha2::{Digest, Sha256};

use crate::{
    error::LlmError,
    mapping::{ModelMapper, ModelPattern},
    protocol::WireFormat,
    script::{ScriptError, TemplateScript, TransformScript},
};

/// Errors building a snapshot. The previous snapshot stays active when one occurs.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to load configuration: {0:#}")]
    Source(anyhow::Error),

    #[error("Invalid configuration: {0:#}")]
    Invalid(anyhow::Error),

    #[error("Provider '{provider}' has an invalid model mapping: {source}")]
    Mapping {
        provider: String,
        #[source]
        source: LlmError,
    },

    #[error("Credential '{credential}' has an invalid model pattern: {source}")]
    AllowedModels {
        credential: String,
        #[source]
        source: LlmError,
    },

    #[error("Provider '{provider}' has an invalid header '{name}'")]
    Header { provider: String, name: String },

    #[error("Provider '{provider}' has no API base and its type has no default")]
    MissingApiBase { provider: String },

    #[error("Provider '{provider}' script failed to compile: {source}")]
    Script {
        provider: String,
        #[source]
        source: ScriptError,
    },

    #[error("Failed to build the upstream HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A provider as the pipeline sees it.
pub struct ProviderEntry {
    pub id: String,
    pub kind: ProviderKind,
    pub wire_format: WireFormat,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub weight: u32,
    pub enabled: bool,
    pub path: Option<String>,
    pub vertex: Option<VertexConfig>,
    pub headers: HeaderMap,
    pub(crate) mapper: ModelMapper,
    pub(crate) script: Option<Arc<dyn TransformScript>>,
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("wire_format", &self.wire_format)
            .field("base_url", &self.base_url)
            .field("weight", &self.weight)
            .field("enabled", &self.enabled)
            .field("script", &self.script.is_some())
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    fn build(id: &str, config: &ProviderConfig) -> Result<Self, SnapshotError> {
        let wire_format = WireFormat::for_provider(config.kind, config.vertex.as_ref());

        let mapper = ModelMapper::new(&config.model_mapping).map_err(|source| SnapshotError::Mapping {
            provider: id.to_string(),
            source,
        })?;

        let base_url = config.base_url().ok_or_else(|| SnapshotError::MissingApiBase {
            provider: id.to_string(),
        })?;

        let mut headers = HeaderMap::new();

        for (name, value) in &config.headers {
            let header_error = || SnapshotError::Header {
                provider: id.to_string(),
                name: name.clone(),
            };

            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| header_error())?;
            let value = HeaderValue::from_str(value).map_err(|_| header_error())?;

            headers.insert(name, value);
        }

        let script = match &config.script {
            Some(path) => {
                let script = TemplateScript::load(path, wire_format).map_err(|source| SnapshotError::Script {
                    provider: id.to_string(),
                    source,
                })?;

                log::debug!("Loaded transform script for provider '{id}': {script:?}");

                Some(Arc::new(script) as Arc<dyn TransformScript>)
            }
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            kind: config.kind,
            wire_format,
            base_url,
            api_key: config.api_key.clone(),
            weight: config.weight,
            enabled: config.enabled,
            path: config.path.clone(),
            vertex: config.vertex.clone(),
            headers,
            mapper,
            script,
        })
    }

    /// The upstream model name for `requested`, or `None` when this provider does not serve it.
    pub fn resolve_model(&self, requested: &str) -> Option<String> {
        self.mapper.resolve(requested)
    }

    pub fn is_pass_through(&self) -> bool {
        self.mapper.is_pass_through()
    }

    pub fn listed_models(&self) -> impl Iterator<Item = &str> {
        self.mapper.listed_models()
    }
}

/// An authenticated client.
#[derive(Debug)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub rate_limit: Option<RateLimitConfig>,
    allowed_models: Vec<ModelPattern>,
}

impl Credential {
    /// The unlimited identity used when no credentials are configured.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".into(),
            name: "anonymous".into(),
            rate_limit: None,
            allowed_models: Vec::new(),
        }
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed_models.is_empty()
    }

    pub fn allows(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|pattern| pattern.matches(model))
    }

    /// Exact model names the credential is limited to, for listings.
    pub fn listed_models(&self) -> impl Iterator<Item = &str> {
        self.allowed_models.iter().filter_map(|pattern| match pattern {
            ModelPattern::Exact(name) => Some(name.as_str()),
            ModelPattern::Pattern(_) => None,
        })
    }
}

/// Lower-case hex SHA-256 of a bearer key, the form credentials are configured with.
pub fn hash_key(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// One consistent view of the configuration.
pub struct Snapshot {
    pub version: u64,
    pub gateway: GatewayConfig,
    pub breaker: BreakerConfig,
    /// Providers in id order.
    pub providers: Vec<ProviderEntry>,
    credentials: HashMap<String, Arc<Credential>>,
    anonymous: Option<Arc<Credential>>,
    pub(crate) http: reqwest::Client,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("providers", &self.providers)
            .field("credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    /// Builds a snapshot. Nothing is shared with the previous one.
    pub fn build(config: &Config, version: u64) -> Result<Self, SnapshotError> {
        config.validate().map_err(SnapshotError::Invalid)?;

        let providers = config
            .providers
            .iter()
            .map(|(id, provider)| ProviderEntry::build(id, provider))
            .collect::<Result<Vec<_>, _>>()?;

        let mut credentials = HashMap::new();

        for (id, credential) in &config.credentials {
            let allowed_models = credential
                .allowed_models
                .iter()
                .map(|pattern| ModelPattern::glob(pattern))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| SnapshotError::AllowedModels {
                    credential: id.clone(),
                    source,
                })?;

            let entry = Credential {
                id: id.clone(),
                name: credential.name.clone().unwrap_or_else(|| id.clone()),
                rate_limit: credential.rate_limit,
                allowed_models,
            };

            credentials.insert(credential.key_hash.to_ascii_lowercase(), Arc::new(entry));
        }

        let anonymous = credentials.is_empty().then(|| {
            log::warn!("No credentials configured, the gateway accepts unauthenticated requests");
            Arc::new(Credential::anonymous())
        });

        let http = reqwest::Client::builder()
            .connect_timeout(config.gateway.connect_timeout)
            .danger_accept_invalid_certs(!config.gateway.verify_tls)
            .build()?;

        Ok(Self {
            version,
            gateway: config.gateway.clone(),
            breaker: config.breaker.clone(),
            providers,
            credentials,
            anonymous,
            http,
        })
    }

    /// Looks up the credential for a bearer key.
    ///
    /// With no credentials configured every request, keyed or not, runs as the anonymous
    /// credential.
    pub fn authenticate(&self, key: Option<&str>) -> Option<Arc<Credential>> {
        if let Some(anonymous) = &self.anonymous {
            return Some(anonymous.clone());
        }

        self.credentials.get(&hash_key(key?)).cloned()
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    pub fn has_credential(&self, id: &str) -> bool {
        self.credentials.values().any(|credential| credential.id == id)
    }

    /// Strips the configured model prefix.
    pub fn strip_prefix<'a>(&self, model: &'a str) -> &'a str {
        match &self.gateway.model_prefix {
            Some(prefix) => model.strip_prefix(prefix.as_str()).unwrap_or(model),
            None => model,
        }
    }

    /// Models a credential may use, for `GET /v1/models`.
    ///
    /// A restricted credential lists its exact allowed names. An unrestricted one lists every
    /// exact mapping source across enabled providers.
    pub fn models_for(&self, credential: &Credential) -> Vec<String> {
        let mut models = BTreeMap::new();

        if credential.is_restricted() {
            for model in credential.listed_models() {
                models.insert(model.to_string(), ());
            }
        } else {
            for provider in self.providers.iter().filter(|provider| provider.enabled) {
                for model in provider.listed_models() {
                    models.insert(model.to_string(), ());
                }
            }
        }

        models.into_keys().collect()
    }
}

/// Where configuration comes from on reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Config>;
}

/// A TOML file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> anyhow::Result<Config> {
        Config::load(&self.path)
    }
}

/// Holds the active snapshot and swaps it atomically on reload.
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    /// Serializes reloads so versions stay monotonic.
    reload_lock: Mutex<()>,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("version", &self.current.load().version)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Builds version 1 from `config`.
    pub fn new(config: &Config) -> Result<Self, SnapshotError> {
        let snapshot = Snapshot::build(config, 1)?;

        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            reload_lock: Mutex::new(()),
        })
    }

    /// The active snapshot. Lock-free.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Builds a snapshot from `config` and makes it current, returning its version.
    pub fn reload(&self, config: &Config) -> Result<u64, SnapshotError> {
        let _guard = self.reload_lock.lock();

        let version = self.current.load().version + 1;

        let snapshot = Snapshot::build(config, version).inspect_err(|e| {
            log::error!("Configuration reload failed, keeping version {}: {e}", version - 1);
        })?;

        self.current.store(Arc::new(snapshot));

        log::info!("Configuration reloaded, now at version {version}");

        Ok(version)
    }

    /// Loads configuration from `source` and reloads from it.
    pub fn reload_from(&self, source: &dyn ConfigSource) -> Result<u64, SnapshotError> {
        let config = source.load().map_err(|e| {
            log::error!("Failed to load configuration for reload: {e:#}");
            SnapshotError::Source(e)
        })?;

        self.reload(&config)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_snapshot;

    use super::*;

    fn config(toml: &str) -> Config {
        Config::parse(toml).unwrap()
    }

    fn minimal() -> Config {
        config(indoc! {r#"
            [providers.openai]
            type = "openai"
        "#})
    }

    struct Unreachable;

    impl ConfigSource for Unreachable {
        fn load(&self) -> anyhow::Result<Config> {
            anyhow::bail!("connection refused")
        }
    }

    #[test]
    fn hashes_keys_as_lower_hex() {
        assert_eq!(
            hash_key("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn authenticates_by_key_hash() {
        let store = SnapshotStore::new(&config(indoc! {r#"
            [providers.openai]
            type = "openai"

            [credentials.team-a]
            key_hash = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
            allowed_models = ["gpt-4o", "claude-*"]
        "#}))
        .unwrap();

        let snapshot = store.current();
        let credential = snapshot.authenticate(Some("secret")).unwrap();

        assert_eq!(credential.id, "team-a");
        assert!(credential.allows("claude-3-5-sonnet"));
        assert!(!credential.allows("gpt-4"));
        assert!(snapshot.authenticate(Some("wrong")).is_none());
        assert!(snapshot.authenticate(None).is_none());
    }

    #[test]
    fn open_gateway_without_credentials() {
        let store = SnapshotStore::new(&minimal()).unwrap();
        let credential = store.current().authenticate(None).unwrap();

        assert_eq!(credential.id, "anonymous");
        assert!(credential.rate_limit.is_none());
    }

    #[test]
    fn reload_bumps_version_and_keeps_readers_on_old_snapshot() {
        let store = SnapshotStore::new(&config(indoc! {r#"
            [providers.a]
            type = "openai"
            api_key = "sk-a"
        "#}))
        .unwrap();

        let in_flight = store.current();

        let version = store
            .reload(&config(indoc! {r#"
                [providers.b]
                type = "anthropic"
                api_key = "sk-b"
            "#}))
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(in_flight.version, 1);
        assert_eq!(in_flight.providers[0].id, "a");
        assert_eq!(store.current().providers[0].id, "b");
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let store = SnapshotStore::new(&minimal()).unwrap();

        let error = store.reload_from(&Unreachable).unwrap_err();

        assert_snapshot!(error, @"Failed to load configuration: connection refused");
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn broken_script_fails_the_build() {
        let mut config = config(indoc! {r#"
            [providers.a]
            type = "openai"
        "#});

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.j2");
        std::fs::write(&path, "{% macro request_out(data, ctx) %}").unwrap();

        if let Some(provider) = config.providers.get_mut("a") {
            provider.script = Some(path);
        }

        let store = SnapshotStore::new(&minimal()).unwrap();

        assert!(matches!(store.reload(&config), Err(SnapshotError::Script { .. })));
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn model_listing() {
        let snapshot = Snapshot::build(
            &config(indoc! {r#"
                [providers.a]
                type = "openai"
                model_mapping = [
                  { from = "fast", to = "gpt-4o-mini" },
                  { from = "gpt-*", to = "gpt-4o" },
                ]

                [providers.b]
                type = "anthropic"
                enabled = false
                model_mapping = [{ from = "claude", to = "claude-3-5-sonnet" }]
            "#}),
            1,
        )
        .unwrap();

        assert_eq!(snapshot.models_for(&Credential::anonymous()), vec!["fast".to_string()]);
    }

    #[test]
    fn strips_model_prefix() {
        let snapshot = Snapshot::build(
            &config(indoc! {r#"
                [gateway]
                model_prefix = "conduit/"

                [providers.openai]
                type = "openai"
            "#}),
            1,
        )
        .unwrap();

        assert_eq!(snapshot.strip_prefix("conduit/gpt-4o"), "gpt-4o");
        assert_eq!(snapshot.strip_prefix("gpt-4o"), "gpt-4o");
    }
}
