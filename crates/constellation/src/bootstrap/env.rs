//! Immutable snapshot of the consumed process environment

use crate::bootstrap::credentials::CredentialRequest;
use std::collections::HashMap;

pub const USERNAME: &str = "USERNAME";
pub const PASSWORD: &str = "PASSWORD";
pub const OWNER_USER_ID: &str = "SPACE_CREATOR_USER_ID";
pub const OWNER_DISPLAY_NAME: &str = "SPACE_AUTHOR_NAME";
pub const OAUTH_CLIENT_ID: &str = "OAUTH_CLIENT_ID";
pub const OAUTH_CLIENT_SECRET: &str = "OAUTH_CLIENT_SECRET";
pub const OAUTH_SCOPES: &str = "OAUTH_SCOPES";
pub const HUB_ENDPOINT: &str = "HF_ENDPOINT";

pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Environment captured once at startup.
///
/// Every bootstrap step reads from this snapshot instead of the live process
/// environment. Unset and empty variables stay distinguishable.
#[derive(Debug, Clone, Default)]
pub struct BootstrapEnv {
    vars: HashMap<String, String>,
}

impl BootstrapEnv {
    /// Capture the current process environment. Variables that are not valid
    /// UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self::from_pairs(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw value, `Some("")` when set to the empty string
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Value if set to something other than the empty string
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.is_empty())
    }

    /// Base URL for the identity lookup, without trailing slash
    pub fn hub_endpoint(&self) -> &str {
        self.non_empty(HUB_ENDPOINT)
            .unwrap_or(DEFAULT_HUB_ENDPOINT)
            .trim_end_matches('/')
    }

    /// Explicit overrides and owner identity for the credential provisioner.
    /// An empty `USERNAME` or `PASSWORD` counts as unset.
    pub fn credential_request(&self) -> CredentialRequest {
        CredentialRequest {
            explicit_username: self.non_empty(USERNAME).map(str::to_string),
            explicit_password: self.non_empty(PASSWORD).map(str::to_string),
            owner_user_id: self.non_empty(OWNER_USER_ID).map(str::to_string),
            owner_display_name: self.non_empty(OWNER_DISPLAY_NAME).map(str::to_string),
        }
    }

    /// Copy of all variables, used as the inherited layer for substitution
    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars.clone()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
