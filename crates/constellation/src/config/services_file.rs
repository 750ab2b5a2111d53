//! Services file YAML schema definitions

use crate::config::{SubstitutionContext, SubstitutionError};
use crate::runtime::RestartPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Built-in descriptor table mirroring the stock deployment
const DEFAULT_SERVICES: &str = include_str!("../../launch/default.services.yaml");

/// Root services file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesFile {
    /// Services file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Environment variables applied to every service
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Service definitions (ordered map for deterministic launch order)
    #[serde(deserialize_with = "unique_keys::deserialize")]
    pub services: IndexMap<String, ServiceConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A single service entry as written by operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Argument vector, or a single string run through `sh -c`
    pub command: CommandSpec,

    /// Delay between supervisor start and the first launch (e.g. `30s`, `500ms`)
    #[serde(default, with = "delay_format")]
    pub start_delay: Duration,

    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Whether an unrecoverable crash takes the whole deployment down
    #[serde(default)]
    pub critical: bool,

    /// Override for the maximum number of consecutive restarts
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// Services that must have started before this one launches
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Environment variables specific to this service
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Command can be an explicit argv or a shell line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandSpec {
    fn is_blank(&self) -> bool {
        match self {
            CommandSpec::Argv(argv) => argv.first().map_or(true, |p| p.trim().is_empty()),
            CommandSpec::Shell(line) => line.trim().is_empty(),
        }
    }
}

/// A fully resolved service, ready to be handed to the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    /// Unique service name, used to tag output
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub start_delay: Duration,
    pub restart: RestartPolicy,
    pub critical: bool,
    pub max_restarts: Option<u32>,
    pub depends_on: Vec<String>,
    pub env: IndexMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ServiceDescriptor {
    /// Create a descriptor with default timing and policy
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            start_delay: Duration::ZERO,
            restart: RestartPolicy::Never,
            critical: false,
            max_restarts: None,
            depends_on: Vec::new(),
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = Some(max_restarts);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Executable to launch
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the program
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

impl ServicesFile {
    /// Load a services file from disk
    pub fn from_file(path: &str) -> Result<Self, ServicesFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServicesFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a services file from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ServicesFileError> {
        let services_file: ServicesFile =
            serde_yaml::from_str(content).map_err(ServicesFileError::Parse)?;
        services_file.validate()?;
        Ok(services_file)
    }

    /// The built-in table used when no services file is given
    pub fn builtin() -> Result<Self, ServicesFileError> {
        Self::from_yaml(DEFAULT_SERVICES)
    }

    /// Validate the services file
    pub fn validate(&self) -> Result<(), ServicesFileError> {
        if self.services.is_empty() {
            return Err(ServicesFileError::Validation(
                "at least one service must be declared".to_string(),
            ));
        }

        for (name, service) in &self.services {
            if name.trim().is_empty() {
                return Err(ServicesFileError::Validation(
                    "service names must not be empty".to_string(),
                ));
            }

            if service.command.is_blank() {
                return Err(ServicesFileError::Validation(format!(
                    "Service '{}': command must not be empty",
                    name
                )));
            }

            for dep in &service.depends_on {
                if dep == name {
                    return Err(ServicesFileError::Validation(format!(
                        "Service '{}': cannot depend on itself",
                        name
                    )));
                }
                if !self.services.contains_key(dep) {
                    return Err(ServicesFileError::Validation(format!(
                        "Service '{}': depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }
        }

        Ok(())
    }

    /// Apply substitutions and produce descriptors in declaration order
    pub fn resolve(
        &self,
        ctx: &SubstitutionContext,
    ) -> Result<Vec<ServiceDescriptor>, ServicesFileError> {
        let mut global_env = IndexMap::new();
        for (key, value) in &self.env {
            global_env.insert(key.clone(), substitute(ctx, value, || format!("env '{}'", key))?);
        }

        // Services see the file-level variables in their own substitutions
        let ctx = ctx.clone().with_envs(global_env.clone());

        let mut descriptors = Vec::with_capacity(self.services.len());
        for (name, service) in &self.services {
            let command = match &service.command {
                CommandSpec::Argv(argv) => argv
                    .iter()
                    .map(|arg| {
                        substitute(&ctx, arg, || format!("service '{}' command", name))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                CommandSpec::Shell(line) => vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    substitute(&ctx, line, || format!("service '{}' command", name))?,
                ],
            };

            let mut env = global_env.clone();
            for (key, value) in &service.env {
                let resolved =
                    substitute(&ctx, value, || format!("service '{}' env '{}'", name, key))?;
                env.insert(key.clone(), resolved);
            }

            let working_dir = service
                .working_dir
                .as_ref()
                .map(|dir| {
                    substitute(&ctx, dir, || format!("service '{}' working_dir", name))
                        .map(PathBuf::from)
                })
                .transpose()?;

            descriptors.push(ServiceDescriptor {
                name: name.clone(),
                command,
                start_delay: service.start_delay,
                restart: service.restart,
                critical: service.critical,
                max_restarts: service.max_restarts,
                depends_on: service.depends_on.clone(),
                env,
                working_dir,
            });
        }

        Ok(descriptors)
    }

    /// Number of critical services
    pub fn critical_count(&self) -> usize {
        self.services.values().filter(|s| s.critical).count()
    }
}

fn substitute(
    ctx: &SubstitutionContext,
    value: &str,
    context: impl FnOnce() -> String,
) -> Result<String, ServicesFileError> {
    ctx.substitute(value)
        .map_err(|source| ServicesFileError::Substitution {
            context: context(),
            source,
        })
}

/// Keep only the services named in `only` (when given) minus those in `skip`
pub fn filter_services(
    descriptors: Vec<ServiceDescriptor>,
    only: &[String],
    skip: &[String],
) -> Result<Vec<ServiceDescriptor>, ServicesFileError> {
    let known: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
    for name in only.iter().chain(skip) {
        if !known.contains(name.as_str()) {
            return Err(ServicesFileError::UnknownService(name.clone()));
        }
    }

    Ok(descriptors
        .into_iter()
        .filter(|d| only.is_empty() || only.contains(&d.name))
        .filter(|d| !skip.contains(&d.name))
        .collect())
}

/// Parse a delay such as `30s`, `500ms`, `2m`, `1h` or a bare number of seconds
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled(value, 60, input),
        "h" => scaled(value, 3600, input),
        other => Err(format!(
            "invalid duration unit '{}' in '{}' (expected ms, s, m or h)",
            other, input
        )),
    }
}

fn scaled(value: u64, factor: u64, input: &str) -> Result<Duration, String> {
    value
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: '{}'", input))
}

/// Map deserialization that rejects a key seen twice instead of keeping the last
mod unique_keys {
    use indexmap::IndexMap;
    use serde::de::{Deserialize, Deserializer, Error, MapAccess, Visitor};
    use std::fmt;
    use std::marker::PhantomData;

    struct UniqueKeys<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeys<V> {
        type Value = IndexMap<String, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of uniquely named services")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if map.contains_key(&key) {
                    return Err(A::Error::custom(format!("service '{}' is declared twice", key)));
                }
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<IndexMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        deserializer.deserialize_map(UniqueKeys(PhantomData))
    }
}

mod delay_format {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DelayValue {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", delay.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match DelayValue::deserialize(deserializer)? {
            DelayValue::Seconds(secs) => Ok(Duration::from_secs(secs)),
            DelayValue::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Errors that can occur when loading a services file
#[derive(Debug, thiserror::Error)]
pub enum ServicesFileError {
    #[error("Failed to read services file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse services file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Unknown service: {0}")]
    UnknownService(String),
}
