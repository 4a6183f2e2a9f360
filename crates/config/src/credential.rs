//! Client credential configuration.

use serde::Deserialize;

/// A client credential (master key).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    /// Human readable name, used in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Lower-case hex SHA-256 of the bearer key.
    pub key_hash: String,
    /// Models this credential may use. Empty allows every model. Entries may use `*`.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Token bucket limit. Absent means unlimited.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Token bucket parameters for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second.
    pub requests_per_second: u32,
    /// Bucket capacity. Defaults to `requests_per_second`.
    #[serde(default)]
    pub burst_size: Option<u32>,
}

impl RateLimitConfig {
    /// Bucket capacity, defaulting to the refill rate.
    pub fn capacity(&self) -> u32 {
        self.burst_size.unwrap_or(self.requests_per_second)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn credential_with_rate_limit() {
        let config = indoc! {r#"
            [credentials.team-a]
            name = "Team A"
            key_hash = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            allowed_models = ["gpt-4", "claude-*"]
            rate_limit = { requests_per_second = 5 }
        "#};

        let config: Config = toml::from_str(config).unwrap();
        let credential = &config.credentials["team-a"];

        assert_eq!(credential.rate_limit.map(|limit| limit.capacity()), Some(5));

        assert_debug_snapshot!(credential, @r#"
        CredentialConfig {
            name: Some(
                "Team A",
            ),
            key_hash: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
            allowed_models: [
                "gpt-4",
                "claude-*",
            ],
            rate_limit: Some(
                RateLimitConfig {
                    requests_per_second: 5,
                    burst_size: None,
                },
            ),
        }
        "#);
    }

    #[test]
    fn explicit_burst() {
        let config = indoc! {r#"
            [credentials.batch]
            key_hash = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            rate_limit = { requests_per_second = 2, burst_size = 10 }
        "#};

        let config: Config = toml::from_str(config).unwrap();

        assert_eq!(config.credentials["batch"].rate_limit.map(|limit| limit.capacity()), Some(10));
    }
}
