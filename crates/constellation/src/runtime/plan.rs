//! Launch plan for dry-run mode

use crate::bootstrap::{is_secret_key, redact, secret_values};
use crate::config::ServiceDescriptor;
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::policy::RestartPolicy;
use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;

/// Services in launch order, as the supervisor would start them
#[derive(Debug)]
pub struct LaunchPlan {
    pub services: Vec<LaunchPlanService>,
    /// Produced environment, secrets already masked
    pub env: IndexMap<String, String>,
}

/// A service in the launch plan
#[derive(Debug)]
pub struct LaunchPlanService {
    pub name: String,
    pub command: Vec<String>,
    pub start_delay: Duration,
    pub restart: RestartPolicy,
    pub critical: bool,
    pub dependencies: Vec<String>,
    pub env: IndexMap<String, String>,
}

impl LaunchPlan {
    pub fn build<'a, I>(
        descriptors: &[ServiceDescriptor],
        environment: I,
    ) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let graph = DependencyGraph::build(descriptors)?;
        let environment: Vec<(&String, &String)> = environment.into_iter().collect();

        let services = graph
            .launch_order()
            .map(|service| {
                let secrets = secret_values(environment.iter().copied().chain(&service.env));
                LaunchPlanService {
                    name: service.name.clone(),
                    command: service
                        .command
                        .iter()
                        .map(|arg| redact(arg, &secrets))
                        .collect(),
                    start_delay: service.start_delay,
                    restart: service.restart,
                    critical: service.critical,
                    dependencies: service.depends_on.clone(),
                    env: mask(service.env.iter()),
                }
            })
            .collect();

        Ok(Self {
            services,
            env: mask(environment),
        })
    }
}

fn mask<'a>(vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> IndexMap<String, String> {
    vars.into_iter()
        .map(|(key, value)| {
            let shown = if is_secret_key(key) {
                "********".to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

/// Display the launch plan in a human-readable format
impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.env.is_empty() {
            writeln!(f, "Produced Environment:")?;
            for (key, value) in &self.env {
                writeln!(f, "  {}={}", key, value)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Services (in launch order):")?;
        for (i, service) in self.services.iter().enumerate() {
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {}{}",
                i + 1,
                service.name,
                if service.critical { " [critical]" } else { "" }
            )?;
            writeln!(f, "     Command: {}", service.command.join(" "))?;
            writeln!(f, "     Restart: {}", service.restart)?;

            if !service.start_delay.is_zero() {
                writeln!(f, "     Start delay: {:?}", service.start_delay)?;
            }

            if !service.dependencies.is_empty() {
                writeln!(f, "     Depends on: {}", service.dependencies.join(", "))?;
            }

            if !service.env.is_empty() {
                writeln!(f, "     Environment:")?;
                for (key, value) in &service.env {
                    writeln!(f, "       {}={}", key, value)?;
                }
            }
        }

        Ok(())
    }
}
