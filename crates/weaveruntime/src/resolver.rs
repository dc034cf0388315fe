//! Dependency resolution: turns a workflow into an execution plan or
//! explains why it cannot run.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use weavecore::{StepId, ValidationError, Workflow, INPUT_ROOT};

/// Validated schedule for a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Top-level steps grouped by dependency depth. Steps in one layer do
    /// not depend on each other.
    pub layers: Vec<Vec<StepId>>,
    /// Every step, each after its dependencies and nested steps before
    /// their owner
    pub order: Vec<StepId>,
}

impl ExecutionPlan {
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn position(&self, step: &str) -> Option<usize> {
        self.order.iter().position(|s| s == step)
    }
}

/// Validate a workflow and compute its execution plan
pub fn resolve(workflow: &Workflow) -> Result<ExecutionPlan, ValidationError> {
    workflow.validate_shape()?;
    check_references(workflow)?;

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &workflow.steps {
        let to = index[step.id.as_str()];
        for dep in &step.depends_on {
            graph.add_edge(index[dep.as_str()], to, ());
        }
        for child in step.kind.nested_steps() {
            graph.add_edge(index[child.as_str()], to, ());
        }
    }

    let order = kahn_order(&graph)?;
    let order: Vec<StepId> = order.into_iter().map(|i| graph[i].to_string()).collect();
    let layers = top_level_layers(workflow, &order);

    Ok(ExecutionPlan { layers, order })
}

/// Every `depends_on` entry and interpolation root must name something
/// visible from the step.
fn check_references(workflow: &Workflow) -> Result<(), ValidationError> {
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    let owners = workflow.owners();

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownStepReference {
                    step: step.id.clone(),
                    reference: dep.clone(),
                });
            }
        }

        let references = step.references().map_err(|e| ValidationError::InvalidStep {
            step: step.id.clone(),
            reason: e.to_string(),
        })?;
        let bindings = workflow.scope_bindings(&step.id);
        for reference in references {
            let root = reference.root.as_str();
            if bindings.contains(root) || root == INPUT_ROOT {
                continue;
            }
            if !ids.contains(root) {
                return Err(ValidationError::UnknownStepReference {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                });
            }
            if let Some(owner) = owners.get(root) {
                return Err(ValidationError::InvalidStep {
                    step: step.id.clone(),
                    reason: format!(
                        "output of nested step '{}' is only visible through '{}'",
                        root, owner
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm. Among steps ready together, declaration order wins.
fn kahn_order(graph: &DiGraph<&str, ()>) -> Result<Vec<NodeIndex>, ValidationError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    let mut frontier: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .collect();

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in frontier {
            order.push(node);
            for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[succ.index()] -= 1;
                if in_degree[succ.index()] == 0 {
                    next.push(succ);
                }
            }
        }
        // Node indices follow declaration order
        next.sort_unstable();
        next.dedup();
        frontier = next;
    }

    if order.len() < graph.node_count() {
        let placed: HashSet<NodeIndex> = order.iter().copied().collect();
        return Err(ValidationError::DependencyCycle {
            cycle: name_cycle(graph, &placed),
        });
    }
    Ok(order)
}

/// Find a cycle among the unplaced steps and spell it out, first step
/// repeated at the end.
fn name_cycle(graph: &DiGraph<&str, ()>, placed: &HashSet<NodeIndex>) -> Vec<StepId> {
    let remainder = graph.filter_map(
        |i, w| (!placed.contains(&i)).then_some((i, *w)),
        |_, _| Some(()),
    );

    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&remainder)
        .into_iter()
        .filter(|c| c.len() > 1 || remainder.find_edge(c[0], c[0]).is_some())
        .collect();
    for c in &mut components {
        c.sort_by_key(|i| remainder[*i].0);
    }
    components.sort_by_key(|c| remainder[c[0]].0);

    let Some(component) = components.into_iter().next() else {
        return Vec::new();
    };
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let start = component[0];

    // Shortest walk from start back to itself inside the component
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut closing = None;
    while let Some(node) = queue.pop_front() {
        let mut succs: Vec<NodeIndex> = remainder
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|s| members.contains(s))
            .collect();
        succs.sort_by_key(|s| remainder[*s].0);
        for succ in succs {
            if succ == start {
                closing = Some(node);
                break;
            }
            if !parent.contains_key(&succ) {
                parent.insert(succ, node);
                queue.push_back(succ);
            }
        }
        if closing.is_some() {
            break;
        }
    }

    let mut path = vec![start];
    if let Some(mut node) = closing {
        let mut back = Vec::new();
        while node != start {
            back.push(node);
            match parent.get(&node) {
                Some(p) => node = *p,
                None => break,
            }
        }
        path.extend(back.into_iter().rev());
    }
    path.push(start);
    path.into_iter().map(|i| remainder[i].1.to_string()).collect()
}

/// Depth of each top-level step over `depends_on` only
fn top_level_layers(workflow: &Workflow, order: &[StepId]) -> Vec<Vec<StepId>> {
    let owners = workflow.owners();
    let mut depth: HashMap<&str, usize> = HashMap::new();
    for id in order {
        if owners.contains_key(id.as_str()) {
            continue;
        }
        let Some(step) = workflow.find_step(id) else {
            continue;
        };
        let d = step
            .depends_on
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
    }

    let mut layers: Vec<Vec<StepId>> = Vec::new();
    for step in workflow.top_level_steps() {
        let d = depth.get(step.id.as_str()).copied().unwrap_or(0);
        if layers.len() <= d {
            layers.resize_with(d + 1, Vec::new);
        }
        layers[d].push(step.id.clone());
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weavecore::WorkflowStep;

    fn tool(id: &str) -> WorkflowStep {
        WorkflowStep::tool(id, "noop")
    }

    #[test]
    fn test_diamond_layers() {
        let wf = Workflow::new("diamond")
            .with_step(tool("a"))
            .with_step(tool("b").depends_on("a"))
            .with_step(tool("c").depends_on("a"))
            .with_step(tool("d").depends_on("b").depends_on("c"));
        let plan = resolve(&wf).unwrap();
        assert_eq!(plan.layers, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(plan.order, vec!["a", "b", "c", "d"]);
        assert_eq!(plan.depth(), 3);
    }

    #[test]
    fn test_declaration_order_tie_break() {
        let wf = Workflow::new("ties")
            .with_step(tool("z").depends_on("y"))
            .with_step(tool("y"))
            .with_step(tool("x"));
        let plan = resolve(&wf).unwrap();
        assert_eq!(plan.order, vec!["y", "x", "z"]);
        assert_eq!(plan.layers, vec![vec!["y", "x"], vec!["z"]]);
    }

    #[test]
    fn test_every_step_after_its_dependencies() {
        let wf = Workflow::new("chain")
            .with_step(tool("e").depends_on("d").depends_on("a"))
            .with_step(tool("d").depends_on("c"))
            .with_step(tool("c").depends_on("b"))
            .with_step(tool("b").depends_on("a"))
            .with_step(tool("a"));
        let plan = resolve(&wf).unwrap();
        for step in &wf.steps {
            for dep in &step.depends_on {
                assert!(plan.position(dep) < plan.position(&step.id));
            }
        }
    }

    #[test]
    fn test_cycle_is_named() {
        let wf = Workflow::new("cycle")
            .with_step(tool("a").depends_on("c"))
            .with_step(tool("b").depends_on("a"))
            .with_step(tool("c").depends_on("b"))
            .with_step(tool("free"));
        match resolve(&wf) {
            Err(ValidationError::DependencyCycle { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency() {
        let wf = Workflow::new("self").with_step(tool("a").depends_on("a"));
        assert_eq!(
            resolve(&wf),
            Err(ValidationError::DependencyCycle {
                cycle: vec!["a".into(), "a".into()]
            })
        );
    }

    #[test]
    fn test_unknown_dependency_and_reference() {
        let wf = Workflow::new("dangling").with_step(tool("a").depends_on("ghost"));
        assert!(matches!(
            resolve(&wf),
            Err(ValidationError::UnknownStepReference { reference, .. }) if reference == "ghost"
        ));

        let wf = Workflow::new("dangling-ref")
            .with_step(tool("a").with_input("x", "$nobody.value"));
        assert!(matches!(
            resolve(&wf),
            Err(ValidationError::UnknownStepReference { .. })
        ));
    }

    #[test]
    fn test_loop_bindings_only_inside_body() {
        let ok = Workflow::new("loop")
            .with_step(WorkflowStep::loop_over("l", json!([1, 2]), "body"))
            .with_step(tool("body").with_input("v", "$item"));
        let plan = resolve(&ok).unwrap();
        assert_eq!(plan.layers, vec![vec!["l"]]);
        assert_eq!(plan.order, vec!["body", "l"]);

        let outside = Workflow::new("leak")
            .with_step(WorkflowStep::loop_over("l", json!([1]), "body"))
            .with_step(tool("body"))
            .with_step(tool("after").depends_on("l").with_input("v", "$item"));
        assert!(matches!(
            resolve(&outside),
            Err(ValidationError::UnknownStepReference { .. })
        ));
    }

    #[test]
    fn test_nested_output_not_visible_outside() {
        let wf = Workflow::new("nested")
            .with_step(WorkflowStep::parallel("p", &["x"]))
            .with_step(tool("x"))
            .with_step(tool("after").depends_on("p").with_input("v", "$x"));
        assert!(matches!(resolve(&wf), Err(ValidationError::InvalidStep { .. })));
    }

    #[test]
    fn test_run_inputs_are_visible() {
        let wf = Workflow::new("inputs").with_step(tool("a").with_input("u", "$input.user"));
        resolve(&wf).unwrap();
    }
}
