//! Job dependency graph built from `needs:`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use super::Workflow;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job '{job}' needs non-existent job '{dependency}'")]
    MissingDependency { job: String, dependency: String },

    #[error("job dependency graph contains a cycle involving '{job}'")]
    CyclicDependency { job: String },
}

/// Jobs as nodes, edges from dependency to dependant.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl JobGraph {
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for id in workflow.jobs.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }

        for (id, job) in &workflow.jobs {
            let job_index = index[id];
            for dependency in &job.needs {
                let dep_index =
                    *index
                        .get(dependency)
                        .ok_or_else(|| GraphError::MissingDependency {
                            job: id.clone(),
                            dependency: dependency.clone(),
                        })?;
                graph.add_edge(dep_index, job_index, ());
            }
        }

        toposort(&graph, None).map_err(|cycle| GraphError::CyclicDependency {
            job: graph[cycle.node_id()].clone(),
        })?;

        Ok(Self { graph, index })
    }

    /// Topological order; among ready jobs, file order wins.
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(|n| Reverse(n.index()))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(i)) = ready.pop() {
            let node = NodeIndex::new(i);
            order.push(self.graph[node].clone());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }
        order
    }

    /// Direct dependencies of a job.
    pub fn dependencies(&self, job: &str) -> Vec<String> {
        self.index
            .get(job)
            .map(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .map(|d| self.graph[d].clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
