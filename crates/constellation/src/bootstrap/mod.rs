//! One-shot bootstrap that runs before any child is launched
//!
//! Credentials are resolved first, then the identity provider variables are
//! materialized. The merged result is an immutable [`BootstrapConfig`] that
//! the supervisor hands to every child.

pub mod credentials;
pub mod env;
pub mod environment;

pub use credentials::*;
pub use env::BootstrapEnv;
pub use environment::*;

use crate::config::ServiceDescriptor;
use crate::runtime::resolve_program;

/// Immutable result of the bootstrap phase
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    credential: Credential,
    environment: EnvironmentSet,
}

impl BootstrapConfig {
    pub fn new(credential: Credential, materialized: EnvironmentSet) -> Self {
        let mut environment = EnvironmentSet::new();
        environment.insert(env::USERNAME, credential.username());
        environment.insert(env::PASSWORD, credential.password());
        for (key, value) in &materialized {
            environment.insert(key.as_str(), value.as_str());
        }

        Self {
            credential,
            environment,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Every produced variable, credentials included
    pub fn environment(&self) -> &EnvironmentSet {
        &self.environment
    }
}

/// Run the credential provisioner and the environment materializer
pub async fn bootstrap(
    env: &BootstrapEnv,
    lookup: &dyn IdentityLookup,
) -> Result<BootstrapConfig, BootstrapError> {
    let credential = resolve_credentials(&env.credential_request(), lookup).await?;
    log::info!("Admin user: {}", credential.username());

    let materialized = materialize(&IdentityProviderMapping::from_env(env));
    log::debug!("Materialized {} identity provider variables", materialized.len());

    Ok(BootstrapConfig::new(credential, materialized))
}

/// Check that every service command can be resolved before launching.
///
/// An unresolvable critical command is an error. Non-critical ones are
/// returned so the caller can warn; they fail at launch instead.
pub fn preflight(
    descriptors: &[ServiceDescriptor],
    path: Option<&str>,
) -> Result<Vec<String>, BootstrapError> {
    let mut unresolved = Vec::new();

    for descriptor in descriptors {
        let program = descriptor.program();
        if resolve_program(program, path, descriptor.working_dir.as_deref()).is_some() {
            continue;
        }

        if descriptor.critical {
            return Err(BootstrapError::UnresolvableCommand {
                service: descriptor.name.clone(),
                program: program.to_string(),
            });
        }

        log::warn!(
            "[{}] Command '{}' not found, the service will fail at launch",
            descriptor.name,
            program
        );
        unresolved.push(descriptor.name.clone());
    }

    Ok(unresolved)
}

/// Fatal bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Critical service '{service}' command not found: {program}")]
    UnresolvableCommand { service: String, program: String },
}
