use crate::types::{StepDefinition, StepId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// Why one step must wait for another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    DependsOn,
    /// Taken when the source step succeeded
    OnSuccess,
    /// Taken when the source step failed
    OnFailure,
    /// Branch group member -> merge step
    MergeAfter,
}

impl EdgeKind {
    /// Route edges decide whether the target runs, not just when
    pub fn is_route(self) -> bool {
        matches!(self, Self::OnSuccess | Self::OnFailure)
    }
}

/// DAG representation of a workflow's step ordering
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<StepId, EdgeKind>,
    step_indices: HashMap<StepId, NodeIndex>,
}

impl WorkflowDag {
    /// Build the graph from validated steps; dangling references are ignored
    pub fn from_steps(steps: &[StepDefinition]) -> Self {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in steps {
            let node = graph.add_node(step.id.clone());
            step_indices.insert(step.id.clone(), node);
        }

        let mut add_edge = |from: &StepId, to: &StepId, kind: EdgeKind| {
            if let (Some(&from), Some(&to)) = (step_indices.get(from), step_indices.get(to)) {
                graph.add_edge(from, to, kind);
            }
        };

        for step in steps {
            for dep in &step.depends_on {
                add_edge(dep, &step.id, EdgeKind::DependsOn);
            }
            if let Some(next) = &step.on_success {
                add_edge(&step.id, next, EdgeKind::OnSuccess);
            }
            if let Some(next) = &step.on_failure {
                add_edge(&step.id, next, EdgeKind::OnFailure);
            }
            if let Some(group) = &step.merge_after {
                for member in steps
                    .iter()
                    .filter(|s| s.branch_group.as_deref() == Some(group.as_str()))
                {
                    add_edge(&member.id, &step.id, EdgeKind::MergeAfter);
                }
            }
        }

        Self {
            graph,
            step_indices,
        }
    }

    /// Incoming edges of a step, in definition order of their sources
    pub fn predecessors(&self, step_id: &str) -> Vec<(StepId, EdgeKind)> {
        let Some(&node) = self.step_indices.get(step_id) else {
            return Vec::new();
        };

        let mut preds: Vec<(NodeIndex, EdgeKind)> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
            .collect();
        preds.sort_by_key(|(source, _)| source.index());

        preds
            .into_iter()
            .map(|(source, kind)| (self.graph[source].clone(), kind))
            .collect()
    }

    /// Incoming `on_success`/`on_failure` edges of a step
    pub fn route_sources(&self, step_id: &str) -> Vec<(StepId, EdgeKind)> {
        self.predecessors(step_id)
            .into_iter()
            .filter(|(_, kind)| kind.is_route())
            .collect()
    }

    /// Steps that wait on the given step
    pub fn dependents(&self, step_id: &str) -> Vec<StepId> {
        let Some(&node) = self.step_indices.get(step_id) else {
            return Vec::new();
        };

        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        deps.sort_by_key(|n| n.index());
        deps.dedup();
        deps.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Steps with no predecessors (can start immediately)
    pub fn entry_steps(&self) -> Vec<StepId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Steps in dependency order, or `None` if `depends_on` edges form a cycle
    pub fn topological_order(&self) -> Option<Vec<StepId>> {
        petgraph::algo::toposort(&self.graph, None)
            .ok()
            .map(|order| order.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(value: serde_json::Value) -> Vec<StepDefinition> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_linear_dag() {
        let steps = steps(json!([
            {"id": "step1", "agent": "a", "on_success": "step2"},
            {"id": "step2", "agent": "a", "depends_on": ["step1"]},
            {"id": "step3", "agent": "a", "depends_on": ["step2"]},
        ]));

        let dag = WorkflowDag::from_steps(&steps);
        let order = dag.topological_order().unwrap();

        assert_eq!(order.len(), 3);
        assert_eq!(order[0].as_str(), "step1");
        assert_eq!(order[1].as_str(), "step2");
        assert_eq!(order[2].as_str(), "step3");
        assert_eq!(dag.entry_steps(), vec![StepId::new("step1")]);
    }

    #[test]
    fn test_route_and_dependency_edges() {
        let steps = steps(json!([
            {"id": "check", "agent": "a", "on_success": "ship", "on_failure": "fix"},
            {"id": "ship", "agent": "a"},
            {"id": "fix", "agent": "a", "depends_on": ["check"]},
        ]));

        let dag = WorkflowDag::from_steps(&steps);

        assert_eq!(
            dag.route_sources("ship"),
            vec![(StepId::new("check"), EdgeKind::OnSuccess)]
        );
        let preds = dag.predecessors("fix");
        assert_eq!(preds.len(), 2);
        assert_eq!(dag.route_sources("fix").len(), 1);
        assert_eq!(
            dag.dependents("check"),
            vec![StepId::new("ship"), StepId::new("fix")]
        );
    }

    #[test]
    fn test_merge_waits_on_branch_group() {
        let steps = steps(json!([
            {"id": "hi", "agent": "a", "branch_group": "sev", "condition": "{{input.high}}"},
            {"id": "lo", "agent": "a", "branch_group": "sev"},
            {"id": "join", "step_type": "merge", "merge_after": "sev"},
        ]));

        let dag = WorkflowDag::from_steps(&steps);
        let preds = dag.predecessors("join");

        assert_eq!(
            preds,
            vec![
                (StepId::new("hi"), EdgeKind::MergeAfter),
                (StepId::new("lo"), EdgeKind::MergeAfter),
            ]
        );
        assert!(dag.route_sources("join").is_empty());
    }

    #[test]
    fn test_dependency_cycle_has_no_order() {
        let steps = steps(json!([
            {"id": "b", "agent": "a", "depends_on": ["c"]},
            {"id": "c", "agent": "a", "depends_on": ["b"]},
        ]));

        let dag = WorkflowDag::from_steps(&steps);
        assert!(dag.topological_order().is_none());
        assert!(dag.entry_steps().is_empty());
    }
}
