// Execution Graph (DAG) Builder
// Builds the stage dependency graph, and the job graph inside each stage

use crate::parser::models::{DependsOn, Job, Pipeline, Stage, Variable};

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{level} '{node}' depends on unknown {level} '{dependency}'")]
    DanglingDependency {
        level: &'static str,
        node: String,
        dependency: String,
    },
    #[error("circular dependency detected in {level}s: {}", .cycle.join(" -> "))]
    CycleDetected {
        level: &'static str,
        cycle: Vec<String>,
    },
}

/// Stages and their dependency edges
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub stages: Vec<StageNode>,
    stage_indices: HashMap<String, usize>,
    /// Pipeline-level variables
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub name: String,
    pub stage: Stage,
    pub dependencies: Vec<String>,
    pub jobs: Vec<JobNode>,
}

#[derive(Debug, Clone)]
pub struct JobNode {
    pub name: String,
    pub job: Job,
    /// Jobs of the same stage
    pub dependencies: Vec<String>,
}

impl ExecutionGraph {
    /// Build and validate the graph of a normalized pipeline.
    ///
    /// A stage without `dependsOn` depends on the stage declared before it;
    /// `dependsOn: []` makes it a root. Jobs depend on nothing unless they say so.
    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let mut stages = Vec::with_capacity(pipeline.stages.len());
        let mut stage_indices = HashMap::new();

        for (i, stage) in pipeline.stages.iter().enumerate() {
            let name = stage.stage.clone().unwrap_or_else(|| format!("stage{}", i + 1));
            let dependencies = match &stage.depends_on {
                DependsOn::Implicit => match i.checked_sub(1).and_then(|p| stages.get(p)) {
                    Some(StageNode { name: previous, .. }) => vec![previous.clone()],
                    None => Vec::new(),
                },
                explicit => explicit.as_vec(),
            };

            stage_indices.insert(name.clone(), i);
            stages.push(StageNode {
                jobs: Self::build_job_nodes(&stage.jobs)?,
                name,
                stage: stage.clone(),
                dependencies,
            });
        }

        let graph = Self {
            stages,
            stage_indices,
            variables: pipeline.variables.clone(),
        };
        graph.validate()?;

        debug!(
            stages = graph.stages.len(),
            jobs = graph.job_count(),
            "execution graph built"
        );
        Ok(graph)
    }

    fn build_job_nodes(jobs: &[Job]) -> Result<Vec<JobNode>, GraphError> {
        let nodes: Vec<JobNode> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| JobNode {
                name: job.job.clone().unwrap_or_else(|| format!("job{}", i + 1)),
                job: job.clone(),
                dependencies: job.depends_on.as_vec(),
            })
            .collect();

        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        for node in &nodes {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !names.contains(&d.as_str()))
            {
                return Err(GraphError::DanglingDependency {
                    level: "job",
                    node: node.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let deps: HashMap<&str, &[String]> = nodes
            .iter()
            .map(|n| (n.name.as_str(), n.dependencies.as_slice()))
            .collect();
        if let Some(cycle) = find_cycle(&names, &deps) {
            return Err(GraphError::CycleDetected { level: "job", cycle });
        }

        Ok(nodes)
    }

    fn validate(&self) -> Result<(), GraphError> {
        for node in &self.stages {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !self.stage_indices.contains_key(d.as_str()))
            {
                return Err(GraphError::DanglingDependency {
                    level: "stage",
                    node: node.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        let deps: HashMap<&str, &[String]> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.dependencies.as_slice()))
            .collect();
        match find_cycle(&names, &deps) {
            Some(cycle) => Err(GraphError::CycleDetected {
                level: "stage",
                cycle,
            }),
            None => Ok(()),
        }
    }

    pub fn get_stage(&self, name: &str) -> Option<&StageNode> {
        self.stage_indices.get(name).map(|&i| &self.stages[i])
    }

    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }

    pub fn step_count(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|s| &s.jobs)
            .map(|j| j.job.steps.len())
            .sum()
    }

    /// Every stage reachable through `dependsOn` edges from `name`
    pub fn ancestors(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.get_stage(current) else {
                continue;
            };
            for dep in &node.dependencies {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    /// Stages in dependency order; ties keep declaration order
    pub fn topological_order(&self) -> Vec<&StageNode> {
        let mut in_degree: Vec<usize> = self.stages.iter().map(|s| s.dependencies.len()).collect();
        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(i) = ready.pop_front() {
            order.push(&self.stages[i]);
            let name = &self.stages[i].name;
            for (j, stage) in self.stages.iter().enumerate() {
                let edges = stage.dependencies.iter().filter(|d| *d == name).count();
                if edges > 0 {
                    in_degree[j] -= edges;
                    if in_degree[j] == 0 {
                        ready.push_back(j);
                    }
                }
            }
        }
        order
    }
}

/// Depth-first search for a cycle; returns the cycle path with its first node repeated
fn find_cycle(nodes: &[&str], deps: &HashMap<&str, &[String]>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        states: &mut HashMap<&'a str, State>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match states.get(node) {
            Some(State::Done) => return None,
            Some(State::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }

        states.insert(node, State::Visiting);
        path.push(node);
        for dep in deps.get(node).copied().unwrap_or_default() {
            if let Some(cycle) = visit(dep.as_str(), deps, states, path) {
                return Some(cycle);
            }
        }
        path.pop();
        states.insert(node, State::Done);
        None
    }

    let mut states = HashMap::new();
    let mut path = Vec::new();
    nodes
        .iter()
        .find_map(|node| visit(*node, deps, &mut states, &mut path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PipelineParser;

    fn graph(yaml: &str) -> Result<ExecutionGraph, GraphError> {
        ExecutionGraph::from_pipeline(&PipelineParser::parse(yaml).unwrap())
    }

    const JOBS: &str = "    jobs:\n      - job: J\n        steps: [{script: x}]\n";

    fn stages(specs: &[(&str, &str)]) -> String {
        let mut yaml = String::from("stages:\n");
        for (name, depends) in specs {
            yaml.push_str(&format!("  - stage: {}\n", name));
            if !depends.is_empty() {
                yaml.push_str(&format!("    dependsOn: {}\n", depends));
            }
            yaml.push_str(JOBS);
        }
        yaml
    }

    #[test]
    fn test_default_dependency_is_previous_stage() {
        let g = graph(&stages(&[("A", ""), ("B", ""), ("C", "[]")])).unwrap();
        assert!(g.get_stage("A").unwrap().dependencies.is_empty());
        assert_eq!(g.get_stage("B").unwrap().dependencies, vec!["A".to_string()]);
        assert!(g.get_stage("C").unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_explicit_dependencies() {
        let g = graph(&stages(&[("A", "[]"), ("B", "[]"), ("C", "[A, B]")])).unwrap();
        assert_eq!(
            g.get_stage("C").unwrap().dependencies,
            vec!["A".to_string(), "B".to_string()]
        );
        let order: Vec<&str> = g.topological_order().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_dangling_stage_dependency() {
        let err = graph(&stages(&[("A", "[]"), ("B", "Nope")])).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                level: "stage",
                node: "B".to_string(),
                dependency: "Nope".to_string()
            }
        );
    }

    #[test]
    fn test_stage_cycle() {
        let err = graph(&stages(&[("A", "C"), ("B", "A"), ("C", "B")])).unwrap_err();
        let GraphError::CycleDetected { level, cycle } = err else {
            panic!("expected cycle");
        };
        assert_eq!(level, "stage");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        assert!(matches!(
            graph(&stages(&[("A", "A")])),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_job_graph() {
        let yaml = r#"
jobs:
  - job: A
    steps: [{script: a}]
  - job: B
    steps: [{script: b}]
  - job: C
    dependsOn: [A, B]
    steps: [{script: c}]
"#;
        let g = graph(yaml).unwrap();
        let jobs = &g.stages[0].jobs;
        assert!(jobs[0].dependencies.is_empty());
        assert!(jobs[1].dependencies.is_empty());
        assert_eq!(jobs[2].dependencies.len(), 2);
    }

    #[test]
    fn test_job_errors() {
        let dangling = "jobs:\n  - job: A\n    dependsOn: Z\n    steps: [{script: a}]\n";
        assert!(matches!(
            graph(dangling),
            Err(GraphError::DanglingDependency { level: "job", .. })
        ));

        let cycle = "jobs:\n  - job: A\n    dependsOn: B\n    steps: [{script: a}]\n  - job: B\n    dependsOn: A\n    steps: [{script: b}]\n";
        assert!(matches!(
            graph(cycle),
            Err(GraphError::CycleDetected { level: "job", .. })
        ));
    }

    #[test]
    fn test_ancestors() {
        let g = graph(&stages(&[("A", "[]"), ("B", "A"), ("C", "[]"), ("D", "[B, C]")])).unwrap();
        let ancestors = g.ancestors("D");
        assert_eq!(ancestors.len(), 3);
        assert!(g.ancestors("A").is_empty());
        assert!(!g.ancestors("C").contains("A"));
    }
}
