//! Substitution engine for $(env), $(optenv), $(timestamp), $(date) patterns

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `$(type argument)` and `$(type)`
static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)\s+([^)]+)\)|\$\((\w+)\)").unwrap());

const MAX_EXPANSION_PASSES: usize = 10;

/// Substitution context containing all available variables.
///
/// Lookups consult `env` (the materialised bootstrap environment plus
/// services-file variables) before `inherited` (the process environment
/// snapshot taken at startup). The live process environment is never read.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Variables produced by the orchestrator
    pub env: HashMap<String, String>,
    /// Variables inherited from the orchestrator's own environment
    pub inherited: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the inherited environment snapshot
    pub fn with_inherited(mut self, inherited: HashMap<String, String>) -> Self {
        self.inherited = inherited;
        self
    }

    /// Substitute all patterns in a string. Substituted values may contain
    /// further patterns; expansion repeats until nothing changes.
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let expanded = self.expand(&current)?;
            if expanded == current {
                return Ok(expanded);
            }
            current = expanded;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }
        Ok(current)
    }

    /// One left-to-right pass over `input`
    fn expand(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut out = String::with_capacity(input.len());
        let mut copied = 0;

        for caps in SUBSTITUTION_PATTERN.captures_iter(input) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&input[copied..whole.start()]);
            out.push_str(&self.resolve(&caps)?);
            copied = whole.end();
        }

        out.push_str(&input[copied..]);
        Ok(out)
    }

    fn resolve(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        let (kind, argument) = match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(kind), Some(argument), _) => (kind.as_str(), argument.as_str().trim()),
            (_, _, Some(kind)) => (kind.as_str(), ""),
            _ => {
                return Err(SubstitutionError::InvalidPattern(
                    caps.get(0)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                ))
            }
        };

        match kind {
            "env" => self
                .lookup(argument)
                .map(str::to_string)
                .ok_or_else(|| SubstitutionError::UndefinedEnv(argument.to_string())),
            "optenv" => Ok(self.resolve_optenv(argument)),
            "timestamp" => Ok(local_now(argument, "%Y%m%d_%H%M%S")),
            "date" => Ok(local_now(argument, "%Y-%m-%d")),
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }

    /// Look up a variable, produced variables first
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.env
            .get(name)
            .or_else(|| self.inherited.get(name))
            .map(String::as_str)
    }

    /// `$(optenv NAME default words)`: value of NAME, or the (possibly empty) default
    fn resolve_optenv(&self, argument: &str) -> String {
        let (name, default) = match argument.split_once(char::is_whitespace) {
            Some((name, default)) => (name, default.trim()),
            None => (argument, ""),
        };
        self.lookup(name).unwrap_or(default).to_string()
    }
}

/// Current local time in `format`, or `fallback` when no format is given
fn local_now(format: &str, fallback: &str) -> String {
    let format = if format.is_empty() { fallback } else { format };
    chrono::Local::now().format(format).to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Invalid substitution pattern: {0}")]
    InvalidPattern(String),

    #[error("Substitution does not settle: {0}")]
    MaxIterationsExceeded(String),
}
