//! Graph ordering and traversal algorithms

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};

use super::Graph;
use crate::error::{GraphError, Result};

/// BFS traversal from start nodes
pub fn bfs<K, F>(start: &[K], max_depth: usize, mut get_neighbors: F) -> Vec<K>
where
    K: Clone + Eq + Hash,
    F: FnMut(&K) -> Vec<K>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from_iter(start.iter().cloned());
    let mut result = Vec::new();
    let mut depth = 0;

    while !queue.is_empty() && depth <= max_depth {
        let level_size = queue.len();

        for _ in 0..level_size {
            if let Some(node) = queue.pop_front() {
                if !visited.insert(node.clone()) {
                    continue;
                }

                for neighbor in get_neighbors(&node) {
                    if !visited.contains(&neighbor) {
                        queue.push_back(neighbor);
                    }
                }

                result.push(node);
            }
        }

        depth += 1;
    }

    result
}

/// One strongly-connected component handed to a `sorted_walk` callback
#[derive(Debug, Clone)]
pub struct WalkStep<R> {
    pub keys: Vec<String>,
    /// Results of every component with an edge into this one
    pub previous: Vec<WalkResult<R>>,
}

#[derive(Debug, Clone)]
pub struct WalkResult<R> {
    pub keys: Vec<String>,
    pub result: R,
}

pub(crate) type SharedResult<R> = Shared<BoxFuture<'static, Result<R>>>;

/// Outgoing keys per node, both ways round for non-directional graphs
fn adjacency<N, E>(graph: &Graph<N, E>) -> HashMap<&str, Vec<&str>> {
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in graph.edges() {
        out.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        if !graph.is_directional() {
            out.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
        }
    }
    out
}

/// Iterative Tarjan. The explicit frame stack keeps long chains off the
/// call stack.
struct Tarjan<'a> {
    successors: HashMap<&'a str, Vec<&'a str>>,
    index: usize,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    indices: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    components: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn new(successors: HashMap<&'a str, Vec<&'a str>>) -> Self {
        Self {
            successors,
            index: 0,
            stack: Vec::new(),
            on_stack: HashSet::new(),
            indices: HashMap::new(),
            lowlink: HashMap::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: &'a str) {
        self.indices.insert(v, self.index);
        self.lowlink.insert(v, self.index);
        self.index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);
    }

    fn strongconnect(&mut self, root: &'a str) {
        // (node, position of the next successor to look at)
        let mut frames: Vec<(&'a str, usize)> = vec![(root, 0)];
        self.visit(root);

        while let Some(frame) = frames.last_mut() {
            let (v, next) = *frame;
            let successor = self.successors.get(v).and_then(|s| s.get(next)).copied();
            if let Some(w) = successor {
                frame.1 += 1;
                if !self.indices.contains_key(w) {
                    self.visit(w);
                    frames.push((w, 0));
                } else if self.on_stack.contains(w) {
                    let low = self.lowlink[v].min(self.indices[w]);
                    self.lowlink.insert(v, low);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                let low = self.lowlink[parent].min(self.lowlink[v]);
                self.lowlink.insert(parent, low);
            }
            if self.lowlink[v] == self.indices[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(w);
                    component.push(w.to_string());
                    if w == v {
                        break;
                    }
                }
                component.sort();
                self.components.push(component);
            }
        }
    }
}

impl<N, E> Graph<N, E> {
    fn check_endpoints(&self) -> Result<()> {
        for edge in self.edges() {
            for key in [&edge.from, &edge.to] {
                if !self.contains(key) {
                    return Err(GraphError::NodeNotFound(key.clone()));
                }
            }
        }
        Ok(())
    }

    /// Kahn-style levels: every edge's source sits in an earlier level than
    /// its target. Keys within a level are sorted, so the order is stable.
    pub fn topological_sort(&self) -> Result<Vec<Vec<String>>> {
        self.check_endpoints()?;

        let mut in_degree: BTreeMap<&str, usize> =
            self.keys().map(|k| (k.as_str(), 0)).collect();
        for edge in self.edges() {
            if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }

        let mut levels = Vec::new();
        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut placed = 0;

        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in self.edges() {
            outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for key in &current {
                for to in outgoing.get(key).into_iter().flatten() {
                    if let Some(d) = in_degree.get_mut(to) {
                        *d -= 1;
                        if *d == 0 {
                            next.insert(*to);
                        }
                    }
                }
            }
            placed += current.len();
            levels.push(current.iter().map(|k| k.to_string()).collect());
            current = next.into_iter().collect();
        }

        if placed < self.node_count() {
            let stuck = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(k, _)| k.to_string())
                .collect();
            return Err(GraphError::CycleDetected(stuck));
        }

        Ok(levels)
    }

    /// Strongly-connected components grouped into generations. Every edge
    /// between two components points from an earlier generation to a later
    /// one, so the members of a generation can be processed concurrently.
    pub fn generation_order(&self) -> Result<Vec<Vec<Vec<String>>>> {
        self.check_endpoints()?;
        Ok(self
            .generations
            .get_or_init(|| self.compute_generations())
            .clone())
    }

    fn compute_generations(&self) -> Vec<Vec<Vec<String>>> {
        let mut tarjan = Tarjan::new(adjacency(self));
        for key in self.keys() {
            if !tarjan.indices.contains_key(key.as_str()) {
                tarjan.strongconnect(key);
            }
        }
        let components = tarjan.components;

        let mut component_of: HashMap<&str, usize> = HashMap::new();
        for (idx, component) in components.iter().enumerate() {
            for key in component {
                component_of.insert(key, idx);
            }
        }

        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut in_degree = vec![0usize; components.len()];
        for edge in self.edges() {
            let (from, to) = (component_of[edge.from.as_str()], component_of[edge.to.as_str()]);
            if from != to && downstream[from].insert(to) {
                in_degree[to] += 1;
            }
        }

        let mut generations = Vec::new();
        let mut current: Vec<usize> = (0..components.len()).filter(|i| in_degree[*i] == 0).collect();
        while !current.is_empty() {
            current.sort_by(|a, b| components[*a][0].cmp(&components[*b][0]));
            let mut next = Vec::new();
            for idx in &current {
                for to in &downstream[*idx] {
                    in_degree[*to] -= 1;
                    if in_degree[*to] == 0 {
                        next.push(*to);
                    }
                }
            }
            generations.push(current.iter().map(|i| components[*i].clone()).collect());
            current = next;
        }
        generations
    }

    /// Components in generation order, each paired with the indices of the
    /// components that have an edge into it.
    pub(crate) fn component_dependencies(&self) -> Result<(Vec<Vec<String>>, Vec<BTreeSet<usize>>)> {
        let components: Vec<Vec<String>> = self.generation_order()?.into_iter().flatten().collect();
        let mut component_of: HashMap<&str, usize> = HashMap::new();
        for (idx, component) in components.iter().enumerate() {
            for key in component {
                component_of.insert(key, idx);
            }
        }
        let mut upstream = vec![BTreeSet::new(); components.len()];
        for edge in self.edges() {
            let (from, to) = (component_of[edge.from.as_str()], component_of[edge.to.as_str()]);
            if from != to {
                upstream[to].insert(from);
            }
            if !self.is_directional() && from != to {
                upstream[from].insert(to);
            }
        }
        Ok((components, upstream))
    }

    /// Run `callback` once per strongly-connected component in generation
    /// order. A component starts as soon as the components feeding it have
    /// resolved; there is no barrier between generations.
    pub async fn sorted_walk<R, F, Fut>(&self, callback: F) -> Result<HashMap<String, R>>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(WalkStep<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let (components, upstream) = self.component_dependencies()?;
        let callback = Arc::new(callback);
        let mut promises: Vec<SharedResult<R>> = Vec::with_capacity(components.len());

        for (idx, keys) in components.iter().enumerate() {
            let deps: Vec<(Vec<String>, SharedResult<R>)> = upstream[idx]
                .iter()
                .map(|u| (components[*u].clone(), promises[*u].clone()))
                .collect();
            let callback = Arc::clone(&callback);
            let keys = keys.clone();
            let promise = async move {
                let mut previous = Vec::with_capacity(deps.len());
                for (keys, dep) in deps {
                    previous.push(WalkResult {
                        keys,
                        result: dep.await?,
                    });
                }
                callback(WalkStep { keys, previous }).await
            }
            .boxed()
            .shared();
            promises.push(promise);
        }

        let settled = join_all(promises).await;
        let mut results = HashMap::new();
        for (keys, outcome) in components.into_iter().zip(settled) {
            let value = outcome?;
            for key in keys {
                results.insert(key, value.clone());
            }
        }
        Ok(results)
    }
}
