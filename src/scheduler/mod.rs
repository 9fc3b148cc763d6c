//! Dependency scheduler
//!
//! Turns plugin declarations into ordered waves with Kahn-style topological
//! layering over the dependency graph. In the default runtime mode mutexes
//! never influence wave membership; conflicts are serialized by the mutex
//! coordinator while the plan runs.

pub mod plan;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::core::config::SchedulingMode;
use crate::core::errors::{ConvoyError, Result};
use crate::plugin::PluginDeclaration;

pub use plan::{ExecutionPlan, ExecutionWave};

/// Build a wave plan where only dependencies constrain wave membership
pub fn build_plan(declarations: &[PluginDeclaration]) -> Result<ExecutionPlan> {
    build_plan_with(declarations, SchedulingMode::Runtime)
}

/// Build a wave plan using the given scheduling mode
pub fn build_plan_with(
    declarations: &[PluginDeclaration],
    mode: SchedulingMode,
) -> Result<ExecutionPlan> {
    let (graph, _) = dependency_graph(declarations)?;
    let layers = layer(&graph)?;

    let layers = match mode {
        SchedulingMode::Runtime => layers,
        SchedulingMode::ScheduleTime => {
            let by_name: HashMap<&str, &PluginDeclaration> = declarations
                .iter()
                .map(|decl| (decl.name.as_str(), decl))
                .collect();
            layers
                .into_iter()
                .flat_map(|layer| split_on_conflicts(layer, &by_name))
                .collect()
        }
    };

    let plan = ExecutionPlan::from_waves(layers);
    info!(
        waves = plan.len(),
        plugins = plan.plugin_count(),
        mode = ?mode,
        "execution plan built"
    );
    Ok(plan)
}

/// Validate declarations and build the graph; edges point from a dependency to its dependent
fn dependency_graph(
    declarations: &[PluginDeclaration],
) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>)> {
    let mut graph = DiGraph::new();
    let mut indices: HashMap<String, NodeIndex> = HashMap::new();

    for decl in declarations {
        if indices.contains_key(&decl.name) {
            return Err(ConvoyError::plugin_configuration(
                &decl.name,
                format!("plugin '{}' is declared more than once", decl.name),
            ));
        }
        let idx = graph.add_node(decl.name.clone());
        indices.insert(decl.name.clone(), idx);
    }

    for decl in declarations {
        for dep in &decl.dependencies {
            if dep == &decl.name {
                return Err(ConvoyError::plugin_configuration(
                    &decl.name,
                    format!("plugin '{}' declares itself as a dependency", decl.name),
                ));
            }
            let dep_idx = indices.get(dep).ok_or_else(|| {
                ConvoyError::plugin_configuration(
                    &decl.name,
                    format!("plugin '{}' depends on unknown plugin '{}'", decl.name, dep),
                )
            })?;
            graph.add_edge(*dep_idx, indices[&decl.name], ());
        }
    }

    Ok((graph, indices))
}

/// Kahn layering: each layer holds every unscheduled node whose dependencies are all in earlier layers
fn layer(graph: &DiGraph<String, ()>) -> Result<Vec<Vec<String>>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx] == 0)
        .collect();
    let mut layers = Vec::new();
    let mut scheduled = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &idx in &current {
            for dependent in graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }

        scheduled += current.len();
        let mut names: Vec<String> = current.iter().map(|idx| graph[*idx].clone()).collect();
        names.sort();
        debug!(wave = layers.len(), plugins = ?names, "dependency layer");
        layers.push(names);
        current = next;
    }

    if scheduled < graph.node_count() {
        let stuck: HashSet<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(idx, _)| *idx)
            .collect();
        return Err(ConvoyError::cycle(minimal_cycle(graph, &stuck)));
    }

    Ok(layers)
}

/// Smallest cycle inside the stuck set, as `a -> b -> a` in depends-on order.
///
/// Falls back to the whole stuck set, sorted, if no cycle can be isolated.
fn minimal_cycle(graph: &DiGraph<String, ()>, stuck: &HashSet<NodeIndex>) -> Vec<String> {
    let mut best: Option<Vec<NodeIndex>> = None;

    for component in tarjan_scc(graph) {
        if component.len() < 2 || !component.iter().all(|idx| stuck.contains(idx)) {
            continue;
        }
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        for &start in &component {
            if let Some(cycle) = shortest_cycle_from(graph, start, &members) {
                let better = match &best {
                    None => true,
                    Some(current) => {
                        cycle.len() < current.len()
                            || (cycle.len() == current.len() && graph[cycle[0]] < graph[current[0]])
                    }
                };
                if better {
                    best = Some(cycle);
                }
            }
        }
    }

    match best {
        Some(cycle) => cycle.iter().map(|idx| graph[*idx].clone()).collect(),
        None => {
            let mut names: Vec<String> = stuck.iter().map(|idx| graph[*idx].clone()).collect();
            names.sort();
            names
        }
    }
}

/// BFS along depends-on edges from `start` back to itself, staying inside `members`
fn shortest_cycle_from(
    graph: &DiGraph<String, ()>,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut deps: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Incoming)
            .filter(|dep| members.contains(dep))
            .collect();
        deps.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

        for dep in deps {
            if dep == start {
                let mut path = vec![node];
                let mut cursor = node;
                while let Some(prev) = parent.get(&cursor) {
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                path.push(start);
                return Some(path);
            }
            if dep != start && !parent.contains_key(&dep) {
                parent.insert(dep, node);
                queue.push_back(dep);
            }
        }
    }
    None
}

/// Greedily split one dependency layer so no wave holds two conflicting plugins
fn split_on_conflicts(
    layer: Vec<String>,
    by_name: &HashMap<&str, &PluginDeclaration>,
) -> Vec<Vec<String>> {
    let mut waves: Vec<Vec<String>> = Vec::new();
    for name in layer {
        let decl = by_name[name.as_str()];
        let slot = waves.iter().position(|wave| {
            wave.iter()
                .all(|other| !decl.conflicts_with(by_name[other.as_str()]))
        });
        match slot {
            Some(i) => waves[i].push(name),
            None => waves.push(vec![name]),
        }
    }
    waves
}
