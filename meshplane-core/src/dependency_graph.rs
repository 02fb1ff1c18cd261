//! Dependency graph (component C4): provides/requires DAG, topological startup ordering,
//! impact analysis.

use crate::error::CoreError;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidesEntry {
    pub service_type: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiresEntry {
    pub service_type: String,
    pub min_version: String,
    pub required_for_startup: bool,
    pub watch_for_changes: bool,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub runtime_id: String,
    pub provides: Vec<ProvidesEntry>,
    pub requires: Vec<RequiresEntry>,
}

#[derive(Debug, Clone)]
pub struct Impact {
    pub target: String,
    pub affected_plugins: Vec<String>,
    pub affected_services: Vec<String>,
}

pub struct DependencyGraph {
    nodes: RwLock<HashMap<String, GraphNode>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_node(
        &self,
        runtime_id: &str,
        provides: Vec<ProvidesEntry>,
        requires: Vec<RequiresEntry>,
    ) {
        self.nodes.write().await.insert(
            runtime_id.to_string(),
            GraphNode {
                runtime_id: runtime_id.to_string(),
                provides,
                requires,
            },
        );
    }

    pub async fn remove_node(&self, runtime_id: &str) {
        self.nodes.write().await.remove(runtime_id);
    }

    pub async fn has_service(&self, service_type: &str) -> bool {
        self.nodes
            .read()
            .await
            .values()
            .any(|n| n.provides.iter().any(|p| p.service_type == service_type))
    }

    /// Returns `runtime_id`s in an order where a provider precedes every consumer that
    /// `required_for_startup`s it. Cycles surface as *FailedPrecondition*, never a partial
    /// order.
    pub async fn startup_order(&self) -> Result<Vec<String>, CoreError> {
        let nodes = self.nodes.read().await;

        // edge A -> B meaning "B must start before A" (A requires what B provides).
        let mut depends_on: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in nodes.keys() {
            in_degree.entry(id.as_str()).or_insert(0);
        }

        for (id, node) in nodes.iter() {
            for requirement in node.requires.iter().filter(|r| r.required_for_startup) {
                for (other_id, other_node) in nodes.iter() {
                    if other_id == id {
                        continue;
                    }
                    if other_node
                        .provides
                        .iter()
                        .any(|p| p.service_type == requirement.service_type)
                    {
                        depends_on.entry(id.as_str()).or_default().push(other_id);
                        *in_degree.entry(id.as_str()).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(nodes.len());
        let mut remaining_in_degree = in_degree.clone();
        let mut consumers_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (consumer, providers) in &depends_on {
            for provider in providers {
                consumers_of.entry(provider).or_default().push(consumer);
            }
        }

        while let Some(id) = ready.pop() {
            order.push(id.to_string());
            if let Some(consumers) = consumers_of.get(id) {
                let mut newly_ready = Vec::new();
                for consumer in consumers {
                    let degree = remaining_in_degree.get_mut(consumer).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(*consumer);
                    }
                }
                newly_ready.sort();
                ready.extend(newly_ready);
            }
        }

        if order.len() != nodes.len() {
            return Err(CoreError::FailedPrecondition(
                "dependency graph contains a required-for-startup cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// `{target, affected_plugins = transitive consumers, affected_services = types the
    /// target uniquely provided}`.
    pub async fn get_impact(&self, runtime_id: &str) -> Impact {
        let nodes = self.nodes.read().await;

        let target_types: HashSet<String> = nodes
            .get(runtime_id)
            .map(|n| n.provides.iter().map(|p| p.service_type.clone()).collect())
            .unwrap_or_default();

        let uniquely_provided: Vec<String> = target_types
            .iter()
            .filter(|service_type| {
                nodes
                    .values()
                    .filter(|n| n.runtime_id != runtime_id)
                    .all(|n| !n.provides.iter().any(|p| &p.service_type == *service_type))
            })
            .cloned()
            .collect();

        let mut affected = HashSet::new();
        let mut frontier: Vec<String> = vec![runtime_id.to_string()];
        while let Some(current) = frontier.pop() {
            let current_types: HashSet<String> = nodes
                .get(&current)
                .map(|n| n.provides.iter().map(|p| p.service_type.clone()).collect())
                .unwrap_or_default();
            for (id, node) in nodes.iter() {
                if id == runtime_id || affected.contains(id) {
                    continue;
                }
                if node
                    .requires
                    .iter()
                    .any(|r| current_types.contains(&r.service_type))
                {
                    affected.insert(id.clone());
                    frontier.push(id.clone());
                }
            }
        }

        Impact {
            target: runtime_id.to_string(),
            affected_plugins: affected.into_iter().collect(),
            affected_services: uniquely_provided,
        }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provides(service_type: &str) -> Vec<ProvidesEntry> {
        vec![ProvidesEntry {
            service_type: service_type.to_string(),
            version: "1.0.0".to_string(),
        }]
    }

    fn requires(service_type: &str) -> Vec<RequiresEntry> {
        vec![RequiresEntry {
            service_type: service_type.to_string(),
            min_version: "1.0.0".to_string(),
            required_for_startup: true,
            watch_for_changes: false,
        }]
    }

    #[tokio::test]
    async fn topological_startup_order_matches_spec_scenario() {
        let graph = DependencyGraph::new();
        graph.add_node("logger", provides("logger"), vec![]).await;
        graph
            .add_node("cache", provides("cache"), requires("logger"))
            .await;
        graph.add_node("app", vec![], requires("cache")).await;

        let order = graph.startup_order().await.unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("logger") < pos("cache"));
        assert!(pos("cache") < pos("app"));
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let graph = DependencyGraph::new();
        graph
            .add_node("a", provides("a"), requires("b"))
            .await;
        graph
            .add_node("b", provides("b"), requires("a"))
            .await;
        let err = graph.startup_order().await.unwrap_err();
        assert!(matches!(err, CoreError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn impact_reports_transitive_consumers_and_unique_services() {
        let graph = DependencyGraph::new();
        graph.add_node("logger", provides("logger"), vec![]).await;
        graph
            .add_node("cache", provides("cache"), requires("logger"))
            .await;
        graph.add_node("app", vec![], requires("cache")).await;

        let impact = graph.get_impact("logger").await;
        assert_eq!(impact.affected_services, vec!["logger".to_string()]);
        assert!(impact.affected_plugins.contains(&"cache".to_string()));
        assert!(impact.affected_plugins.contains(&"app".to_string()));
    }
}
