//! Dependency graph construction and topological sorting

use crate::config::ServiceDescriptor;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Services ordered so that every dependency precedes its dependents
#[derive(Debug)]
pub struct DependencyGraph {
    /// Descriptors in launch order
    pub services: Vec<ServiceDescriptor>,
}

impl DependencyGraph {
    /// Build a dependency graph from descriptors
    pub fn build(descriptors: &[ServiceDescriptor]) -> Result<Self, DependencyError> {
        let mut by_name: IndexMap<&str, &ServiceDescriptor> = IndexMap::new();
        for descriptor in descriptors {
            if by_name.insert(&descriptor.name, descriptor).is_some() {
                return Err(DependencyError::DuplicateService(descriptor.name.clone()));
            }
        }

        for descriptor in descriptors {
            for dep in &descriptor.depends_on {
                if !by_name.contains_key(dep.as_str()) {
                    return Err(DependencyError::UnknownDependency {
                        service: descriptor.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let services = Self::topological_sort(&by_name)?;
        Ok(Self { services })
    }

    /// Kahn's algorithm. Among services whose dependencies are satisfied the
    /// earliest declared goes first, so a table without `depends_on` keeps
    /// its declaration order.
    fn topological_sort(
        services: &IndexMap<&str, &ServiceDescriptor>,
    ) -> Result<Vec<ServiceDescriptor>, DependencyError> {
        let mut in_degree: Vec<usize> = services
            .values()
            .map(|service| service.depends_on.len())
            .collect();

        let mut sorted: Vec<ServiceDescriptor> = Vec::with_capacity(services.len());
        let mut placed = vec![false; services.len()];

        while sorted.len() < services.len() {
            let Some(next) = (0..services.len()).find(|&i| !placed[i] && in_degree[i] == 0) else {
                break;
            };

            placed[next] = true;
            let (name, service) = services
                .get_index(next)
                .map(|(name, service)| (*name, *service))
                .ok_or_else(|| DependencyError::CyclicDependency(Vec::new()))?;
            sorted.push(service.clone());

            // Reduce in-degree for dependents
            for (i, dependent) in services.values().enumerate() {
                let edges = dependent.depends_on.iter().filter(|d| *d == name).count();
                in_degree[i] = in_degree[i].saturating_sub(edges);
            }
        }

        // Check for cycles
        if sorted.len() != services.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
            let cycle_services = services
                .keys()
                .filter(|name| !sorted_names.contains(*name))
                .map(|name| name.to_string())
                .collect();

            return Err(DependencyError::CyclicDependency(cycle_services));
        }

        Ok(sorted)
    }

    /// Get the launch order
    pub fn launch_order(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, deps: &[&str]) -> ServiceDescriptor {
        deps.iter()
            .fold(ServiceDescriptor::new(name, [format!("bin/{}", name)]), |d, dep| {
                d.depends_on(*dep)
            })
    }

    fn order(graph: &DependencyGraph) -> Vec<&str> {
        graph.launch_order().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_declaration_order_without_dependencies() {
        let graph = DependencyGraph::build(&[
            service("elastic", &[]),
            service("redis", &[]),
            service("server", &[]),
        ])
        .unwrap();

        assert_eq!(order(&graph), vec!["elastic", "redis", "server"]);
    }

    #[test]
    fn test_simple_dependency_order() {
        let graph = DependencyGraph::build(&[
            service("c", &["b"]),
            service("b", &["a"]),
            service("a", &[]),
        ])
        .unwrap();

        assert_eq!(order(&graph), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let graph = DependencyGraph::build(&[
            service("a", &[]),
            service("b", &["a"]),
            service("c", &["a"]),
            service("d", &["b", "c"]),
        ])
        .unwrap();

        assert_eq!(order(&graph), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cyclic_dependency_detection() {
        let result = DependencyGraph::build(&[
            service("a", &["c"]),
            service("b", &["a"]),
            service("c", &["b"]),
            service("free", &[]),
        ]);

        match result {
            Err(DependencyError::CyclicDependency(names)) => {
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_and_unknown() {
        assert!(matches!(
            DependencyGraph::build(&[service("a", &[]), service("a", &[])]),
            Err(DependencyError::DuplicateService(_))
        ));
        assert!(matches!(
            DependencyGraph::build(&[service("a", &["ghost"])]),
            Err(DependencyError::UnknownDependency { .. })
        ));
    }
}
