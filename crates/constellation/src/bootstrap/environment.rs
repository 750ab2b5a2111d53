//! Environment Materializer - identity provider variables for downstream services

use crate::bootstrap::env::{BootstrapEnv, OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET, OAUTH_SCOPES};
use indexmap::IndexMap;
use std::fmt;

pub const INTERNAL_CLIENT_ID: &str = "OAUTH2_HUGGINGFACE_CLIENT_ID";
pub const INTERNAL_CLIENT_SECRET: &str = "OAUTH2_HUGGINGFACE_CLIENT_SECRET";
pub const INTERNAL_SCOPE: &str = "OAUTH2_HUGGINGFACE_SCOPE";

const MASK: &str = "********";

/// External identity provider configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityProviderMapping {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<String>,
}

impl IdentityProviderMapping {
    /// Read the external variables. Empty values are kept as empty.
    pub fn from_env(env: &BootstrapEnv) -> Self {
        Self {
            client_id: env.get(OAUTH_CLIENT_ID).map(str::to_string),
            client_secret: env.get(OAUTH_CLIENT_SECRET).map(str::to_string),
            scopes: env.get(OAUTH_SCOPES).map(str::to_string),
        }
    }
}

/// Variables produced for child processes, in insertion order
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    vars: IndexMap<String, String>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<'a> IntoIterator for &'a EnvironmentSet {
    type Item = (&'a String, &'a String);
    type IntoIter = indexmap::map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

/// Masks secret values
impl fmt::Debug for EnvironmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.iter().map(|(k, v)| (k, display_value(k, v))))
            .finish()
    }
}

/// One `KEY=value` per line, secrets masked
impl fmt::Display for EnvironmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.vars {
            writeln!(f, "{}={}", key, display_value(key, value))?;
        }
        Ok(())
    }
}

fn display_value<'a>(key: &str, value: &'a str) -> &'a str {
    if is_secret_key(key) {
        MASK
    } else {
        value
    }
}

/// Whether the value of `key` must never be shown
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    ["PASSWORD", "SECRET", "TOKEN"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// Values of the secret variables among `vars`, longest first
pub fn secret_values<'a, I>(vars: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut secrets: Vec<&str> = vars
        .into_iter()
        .filter(|(key, value)| is_secret_key(key) && !value.is_empty())
        .map(|(_, value)| value.as_str())
        .collect();
    secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
    secrets.dedup();
    secrets
}

/// Mask every occurrence of a secret value in `text`
pub fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .fold(text.to_string(), |text, secret| text.replace(secret, MASK))
}

/// Map the external identity provider variables to the internal names.
/// A variable absent on input is absent on output.
pub fn materialize(mapping: &IdentityProviderMapping) -> EnvironmentSet {
    let mut set = EnvironmentSet::new();

    for (key, value) in [
        (INTERNAL_CLIENT_ID, &mapping.client_id),
        (INTERNAL_CLIENT_SECRET, &mapping.client_secret),
        (INTERNAL_SCOPE, &mapping.scopes),
    ] {
        if let Some(value) = value {
            set.insert(key, value.as_str());
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mapping() {
        let env = BootstrapEnv::from_pairs([
            (OAUTH_CLIENT_ID, "client"),
            (OAUTH_CLIENT_SECRET, "hush"),
            (OAUTH_SCOPES, "openid profile"),
        ]);

        let set = materialize(&IdentityProviderMapping::from_env(&env));

        assert_eq!(set.get(INTERNAL_CLIENT_ID), Some("client"));
        assert_eq!(set.get(INTERNAL_CLIENT_SECRET), Some("hush"));
        assert_eq!(set.get(INTERNAL_SCOPE), Some("openid profile"));
    }

    #[test]
    fn test_absent_never_becomes_empty() {
        let inputs = [None, Some(""), Some("value")];
        for client_id in inputs {
            for client_secret in inputs {
                for scopes in inputs {
                    let mapping = IdentityProviderMapping {
                        client_id: client_id.map(str::to_string),
                        client_secret: client_secret.map(str::to_string),
                        scopes: scopes.map(str::to_string),
                    };
                    let set = materialize(&mapping);

                    for (external, internal) in [
                        (client_id, INTERNAL_CLIENT_ID),
                        (client_secret, INTERNAL_CLIENT_SECRET),
                        (scopes, INTERNAL_SCOPE),
                    ] {
                        assert_eq!(set.get(internal), external);
                    }
                }
            }
        }
    }

    #[test]
    fn test_display_masks_secrets() {
        let mut set = EnvironmentSet::new();
        set.insert("USERNAME", "owner");
        set.insert("PASSWORD", "plaintext");
        set.insert(INTERNAL_CLIENT_SECRET, "hush");

        let shown = set.to_string();
        assert!(shown.contains("USERNAME=owner"));
        assert!(!shown.contains("plaintext"));
        assert!(!shown.contains("hush"));
        assert!(!format!("{:?}", set).contains("plaintext"));
    }

    #[test]
    fn test_secret_key_detection() {
        assert!(is_secret_key("PASSWORD"));
        assert!(is_secret_key("db_password"));
        assert!(is_secret_key("HF_TOKEN"));
        assert!(!is_secret_key("USERNAME"));
    }

    #[test]
    fn test_redact_secret_values() {
        let vars = IndexMap::from([
            ("USERNAME".to_string(), "owner".to_string()),
            ("PASSWORD".to_string(), "s3cr3t".to_string()),
            ("API_TOKEN".to_string(), String::new()),
        ]);
        let secrets = secret_values(&vars);
        assert_eq!(secrets, vec!["s3cr3t"]);

        assert_eq!(
            redact("server --admin owner --password=s3cr3t", &secrets),
            "server --admin owner --password=********"
        );
        assert_eq!(redact("nothing to hide", &[]), "nothing to hide");
    }
}
