//! Secret resolution and log redaction.
//!
//! Secrets referenced by the workflow (`secrets.DO_PASSWORD`, ...) are read
//! from the process environment once per run. A missing secret resolves to an
//! empty string, the same as on GitHub-hosted runners.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

/// Minimum secret length to redact (shorter values cause false positives).
pub const MIN_SECRET_LENGTH: usize = 4;

/// Placeholder for redacted secrets.
pub const REDACTED_PLACEHOLDER: &str = "***";

/// Resolved secret values, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: Arc<BTreeMap<String, SecretString>>,
}

impl Secrets {
    /// Resolve each named secret from the environment variable of the same name.
    pub fn from_env<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    values.insert(name.to_string(), SecretString::from(value));
                }
                _ => tracing::warn!(secret = %name, "Secret not set, resolving to empty string"),
            }
        }
        Self {
            values: Arc::new(values),
        }
    }

    /// Build from explicit name/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), SecretString::from(v.into())))
            .collect();
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SecretString> {
        self.values.get(name)
    }

    /// Build a redactor covering every resolved secret.
    pub fn redactor(&self) -> LogRedactor {
        let (redactor, warnings) = LogRedactor::with_names(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.expose_secret().to_string())),
        );
        for warning in warnings {
            tracing::warn!(
                secret = %warning.key,
                len = warning.length,
                "Secret too short to redact from logs"
            );
        }
        redactor
    }
}

/// Secret that was too short to redact safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortSecretWarning {
    pub key: String,
    pub length: usize,
}

/// Replaces secret values in captured output.
#[derive(Debug, Clone, Default)]
pub struct LogRedactor {
    /// Sorted by length descending so longer secrets win over their substrings.
    secrets: Vec<String>,
}

impl LogRedactor {
    pub fn with_names(
        secrets: impl IntoIterator<Item = (String, String)>,
    ) -> (Self, Vec<ShortSecretWarning>) {
        let mut warnings = Vec::new();
        let mut unique = HashSet::new();

        for (key, value) in secrets {
            if value.len() < MIN_SECRET_LENGTH {
                warnings.push(ShortSecretWarning {
                    key,
                    length: value.len(),
                });
            } else {
                unique.insert(value);
            }
        }

        let mut secrets: Vec<String> = unique.into_iter().collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        (Self { secrets }, warnings)
    }

    pub fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for secret in &self.secrets {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), REDACTED_PLACEHOLDER);
            }
        }
        output
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_secret_values() {
        let secrets = Secrets::from_pairs([("DO_PASSWORD", "hunter22"), ("DO_HOST", "10.0.0.5")]);
        let redactor = secrets.redactor();
        assert_eq!(
            redactor.redact("ssh root@10.0.0.5 with hunter22"),
            "ssh root@*** with ***"
        );
    }

    #[test]
    fn test_longer_secret_wins() {
        let (redactor, _) = LogRedactor::with_names([
            ("A".to_string(), "secret".to_string()),
            ("B".to_string(), "secret-extended".to_string()),
        ]);
        assert_eq!(redactor.redact("x secret-extended y"), "x *** y");
    }

    #[test]
    fn test_short_secret_warning() {
        let (redactor, warnings) = LogRedactor::with_names([
            ("DO_USERNAME".to_string(), "ab".to_string()),
            ("DO_PASSWORD".to_string(), "abcd".to_string()),
        ]);
        assert_eq!(
            warnings,
            vec![ShortSecretWarning {
                key: "DO_USERNAME".to_string(),
                length: 2
            }]
        );
        assert_eq!(redactor.redact("ab abcd"), "ab ***");
    }

    #[test]
    fn test_missing_secret_is_absent() {
        let secrets = Secrets::from_env(["BIRTHNON_TEST_SECRET_THAT_IS_NEVER_SET"]);
        assert!(secrets.get("BIRTHNON_TEST_SECRET_THAT_IS_NEVER_SET").is_none());
        assert!(secrets.redactor().is_empty());
    }
}
