use std::{fmt::Write, path::Path, str::FromStr};

use anyhow::{Context, bail};
use indoc::indoc;
use regex::Regex;
use serde::Deserialize;
use serde_dynamic_string::DynamicString;
use toml::Value;

use crate::{Config, MatchKind, ProviderConfig, ProviderKind};

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file '{}'", path.display()))?;

    parse(&content).with_context(|| format!("Invalid configuration in '{}'", path.display()))
}

pub(crate) fn parse(content: &str) -> anyhow::Result<Config> {
    let mut raw_config: Value = toml::from_str(content)?;
    expand_dynamic_strings(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.providers.is_empty() {
        bail!(indoc! {r#"
            No providers configured. Conduit requires at least one upstream provider to function.

            Example configuration:

              [providers.openai]
              type = "openai"
              api_key = "{{ env.OPENAI_API_KEY }}"
        "#});
    }

    for (id, provider) in &config.providers {
        validate_provider(id, provider)?;
    }

    for (id, credential) in &config.credentials {
        let hash = &credential.key_hash;

        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            bail!("Credential '{id}' key_hash must be a lower-case hex SHA-256 digest");
        }

        if let Some(limit) = &credential.rate_limit
            && (limit.requests_per_second == 0 || limit.capacity() == 0)
        {
            bail!("Credential '{id}' rate_limit values must be greater than zero");
        }
    }

    if config.server.health.enabled && !config.server.health.path.starts_with('/') {
        bail!("server.health.path must start with '/', got '{}'", config.server.health.path);
    }

    let threshold = config.breaker.failure_threshold;

    if !(0.0..1.0).contains(&threshold) {
        bail!("breaker.failure_threshold must be in [0.0, 1.0), got {threshold}");
    }

    if config.gateway.ttft_timeout > config.gateway.request_timeout {
        log::warn!("gateway.ttft_timeout is longer than gateway.request_timeout and will never fire");
    }

    Ok(())
}

fn validate_provider(id: &str, provider: &ProviderConfig) -> anyhow::Result<()> {
    if provider.weight == 0 {
        bail!("Provider '{id}' weight must be at least 1");
    }

    match provider.kind {
        ProviderKind::Vertex if provider.vertex.is_none() => {
            bail!("Provider '{id}' of type 'vertex' requires a [providers.{id}.vertex] table with project and location")
        }
        ProviderKind::Custom if provider.api_base.is_none() => {
            bail!("Provider '{id}' of type 'custom' requires api_base")
        }
        _ => (),
    }

    if provider.vertex.is_some() && provider.kind != ProviderKind::Vertex {
        bail!("Provider '{id}' sets a vertex table but is not of type 'vertex'");
    }

    for rule in &provider.model_mapping {
        if rule.kind() == MatchKind::Regex {
            Regex::new(&rule.from)
                .with_context(|| format!("Provider '{id}' model_mapping rule '{}' is not a valid regex", rule.from))?;
        }
    }

    Ok(())
}

fn expand_dynamic_strings<'a>(path: &mut Vec<Result<&'a str, usize>>, value: &'a mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => match DynamicString::<String>::from_str(s) {
            Ok(out) => *s = out.into_inner(),
            Err(err) => {
                let mut p = String::new();

                for segment in path {
                    match segment {
                        Ok(s) => {
                            p.push_str(s);
                            p.push('.');
                        }
                        Err(i) => write!(p, "[{i}]")?,
                    }
                }

                if p.ends_with('.') {
                    p.pop();
                }

                bail!("Failed to expand dynamic string at path '{p}': {err}");
            }
        },
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}
