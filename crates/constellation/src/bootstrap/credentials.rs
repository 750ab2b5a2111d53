//! Credential Provisioner - default admin identity when none is supplied

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::time::Duration;

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 16;

/// Characters a generated password is drawn from
pub const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Username used when neither an override nor an owner name is available
pub const FALLBACK_USERNAME: &str = "admin";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved admin identity. `Debug` never shows the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Inputs to [`resolve_credentials`]
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest {
    pub explicit_username: Option<String>,
    pub explicit_password: Option<String>,
    pub owner_user_id: Option<String>,
    pub owner_display_name: Option<String>,
}

/// Resolves a user id to a display name
#[async_trait::async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<String, LookupError>;
}

/// Identity lookup against the hub's public user overview endpoint
pub struct HubIdentityLookup {
    client: reqwest::Client,
    endpoint: String,
}

impl HubIdentityLookup {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, LookupError> {
        Self::with_timeout(endpoint, LOOKUP_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

/// `<endpoint>/api/users/<user_id>/overview` with the id percent-encoded as
/// one path segment
fn overview_url(endpoint: &str, user_id: &str) -> Result<reqwest::Url, LookupError> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| LookupError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| LookupError::InvalidEndpoint(endpoint.to_string()))?
        .pop_if_empty()
        .extend(["api", "users", user_id, "overview"]);
    Ok(url)
}

#[async_trait::async_trait]
impl IdentityLookup for HubIdentityLookup {
    async fn display_name(&self, user_id: &str) -> Result<String, LookupError> {
        let url = overview_url(&self.endpoint, user_id)?;
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(LookupError::Status(resp.status().as_u16()));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LookupError::Malformed(e.to_string()))?;

        body.get("user")
            .and_then(|user| user.as_str())
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .ok_or_else(|| LookupError::Malformed("missing 'user' field".to_string()))
    }
}

/// Lookup that always fails, used when no HTTP client can be built
#[derive(Debug, Clone)]
pub struct UnavailableLookup {
    reason: String,
}

impl UnavailableLookup {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl IdentityLookup for UnavailableLookup {
    async fn display_name(&self, _user_id: &str) -> Result<String, LookupError> {
        Err(LookupError::Unavailable(self.reason.clone()))
    }
}

/// The hub lookup for `endpoint`, or an [`UnavailableLookup`] if its client
/// cannot be built. Never fails: the username then falls back.
pub fn identity_lookup(endpoint: &str) -> Box<dyn IdentityLookup> {
    match HubIdentityLookup::new(endpoint) {
        Ok(lookup) => Box::new(lookup),
        Err(e) => {
            log::warn!("Identity lookup disabled: {}", e);
            Box::new(UnavailableLookup::new(e.to_string()))
        }
    }
}

/// Resolve the admin credential.
///
/// Username: explicit override, else the looked-up name of the owner, else
/// the owner display name, else [`FALLBACK_USERNAME`]. Lookup failures are
/// logged and never returned. Password: explicit override, else generated.
pub async fn resolve_credentials(
    request: &CredentialRequest,
    lookup: &dyn IdentityLookup,
) -> Result<Credential, CredentialError> {
    let username = match &request.explicit_username {
        Some(username) => username.clone(),
        None => resolve_username(request, lookup).await,
    };

    let password = match &request.explicit_password {
        Some(password) => password.clone(),
        None => {
            log::info!("No admin password supplied, generating one");
            generate_password()?
        }
    };

    Ok(Credential { username, password })
}

async fn resolve_username(request: &CredentialRequest, lookup: &dyn IdentityLookup) -> String {
    if let Some(user_id) = &request.owner_user_id {
        match lookup.display_name(user_id).await {
            Ok(name) => {
                log::info!("Resolved admin username from owner id: {}", name);
                return name;
            }
            Err(e) => {
                log::warn!("Owner name lookup failed, falling back: {}", e);
            }
        }
    }

    match &request.owner_display_name {
        Some(name) => name.clone(),
        None => {
            log::warn!("No owner name available, using '{}'", FALLBACK_USERNAME);
            FALLBACK_USERNAME.to_string()
        }
    }
}

/// Generate a password from the operating system's CSPRNG
pub fn generate_password() -> Result<String, CredentialError> {
    generate_password_with(&mut OsRng)
}

/// Generate a password from `rng`, failing if the source does
pub fn generate_password_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<String, CredentialError> {
    // Largest multiple of the alphabet size below 256; bytes above it would
    // bias the first characters.
    let limit = (256 / PASSWORD_ALPHABET.len() * PASSWORD_ALPHABET.len()) as u8;

    let mut password = String::with_capacity(PASSWORD_LENGTH);
    let mut buf = [0u8; 32];

    while password.len() < PASSWORD_LENGTH {
        rng.try_fill_bytes(&mut buf)?;
        for byte in buf.iter().copied().filter(|b| *b < limit) {
            if password.len() == PASSWORD_LENGTH {
                break;
            }
            password.push(PASSWORD_ALPHABET[byte as usize % PASSWORD_ALPHABET.len()] as char);
        }
    }

    Ok(password)
}

/// Errors from the identity lookup. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid hub endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("lookup unavailable: {0}")]
    Unavailable(String),
}

/// Errors that prevent an admin credential from being produced
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to generate admin password: {0}")]
    Entropy(#[from] rand::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FixedLookup(Result<&'static str, u16>);

    #[async_trait::async_trait]
    impl IdentityLookup for FixedLookup {
        async fn display_name(&self, _user_id: &str) -> Result<String, LookupError> {
            self.0.map(str::to_string).map_err(LookupError::Status)
        }
    }

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, _dest: &mut [u8]) {}

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::other("entropy source unavailable")))
        }
    }

    fn request(
        username: Option<&str>,
        password: Option<&str>,
        owner_id: Option<&str>,
        owner_name: Option<&str>,
    ) -> CredentialRequest {
        CredentialRequest {
            explicit_username: username.map(str::to_string),
            explicit_password: password.map(str::to_string),
            owner_user_id: owner_id.map(str::to_string),
            owner_display_name: owner_name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_explicit_values_are_returned_unchanged() {
        let lookup = FixedLookup(Ok("looked-up"));
        for (username, password) in [("alice", "pa55word"), (" spaced ", "x"), ("ü", "ß!")] {
            let credential = resolve_credentials(
                &request(Some(username), Some(password), Some("id"), Some("owner")),
                &lookup,
            )
            .await
            .unwrap();

            assert_eq!(credential.username(), username);
            assert_eq!(credential.password(), password);
        }
    }

    #[tokio::test]
    async fn test_lookup_success_and_failure() {
        let req = request(None, Some("pw"), Some("id"), Some("owner"));

        let ok = resolve_credentials(&req, &FixedLookup(Ok("hub-name")))
            .await
            .unwrap();
        assert_eq!(ok.username(), "hub-name");

        let failed = resolve_credentials(&req, &FixedLookup(Err(404)))
            .await
            .unwrap();
        assert_eq!(failed.username(), "owner");
    }

    #[tokio::test]
    async fn test_no_owner_information_uses_fallback() {
        let credential = resolve_credentials(&request(None, None, None, None), &FixedLookup(Err(500)))
            .await
            .unwrap();

        assert_eq!(credential.username(), FALLBACK_USERNAME);
        assert_eq!(credential.password().len(), PASSWORD_LENGTH);
    }

    #[tokio::test]
    async fn test_unavailable_lookup_falls_back() {
        let req = request(None, Some("pw"), Some("id"), Some("owner"));
        let lookup = UnavailableLookup::new("no TLS backend");

        assert!(matches!(
            lookup.display_name("id").await,
            Err(LookupError::Unavailable(_))
        ));
        let credential = resolve_credentials(&req, &lookup).await.unwrap();
        assert_eq!(credential.username(), "owner");
    }

    #[test]
    fn test_overview_url_encodes_user_id() {
        let url = overview_url("http://hub.local", "a/b?c#d").unwrap();
        assert_eq!(url.as_str(), "http://hub.local/api/users/a%2Fb%3Fc%23d/overview");

        let url = overview_url("https://hub.local/mirror", "6543").unwrap();
        assert_eq!(url.path(), "/mirror/api/users/6543/overview");

        assert!(matches!(
            overview_url("not a url", "6543"),
            Err(LookupError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_generated_passwords_are_unique() {
        let passwords: HashSet<String> = (0..1000).map(|_| generate_password().unwrap()).collect();

        assert_eq!(passwords.len(), 1000);
        for password in &passwords {
            assert_eq!(password.len(), PASSWORD_LENGTH);
            assert!(password.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_entropy_failure_is_an_error() {
        assert!(matches!(
            generate_password_with(&mut BrokenRng),
            Err(CredentialError::Entropy(_))
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential::new("admin", "very-secret-value");
        let shown = format!("{:?}", credential);

        assert!(shown.contains("admin"));
        assert!(!shown.contains("very-secret-value"));
    }
}
