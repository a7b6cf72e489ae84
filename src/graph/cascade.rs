//! Dependency-ordered evaluation over a template graph
//!
//! `CascadeGraph` splits the work for each node into a batched `fetch`
//! (one call per generation) and a per-node `process` that sees the results
//! of every upstream node feeding it. Cycles are never walked: a strongly
//! connected component with more than one member is handed to the optional
//! `circular` callback as a unit, and rejected when no such callback exists.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};

use super::traversal::SharedResult;
use super::Graph;
use crate::error::{GraphError, Result};

/// Template data for one cascade node
#[derive(Debug, Clone)]
pub struct CascadeNode<T> {
    pub data: T,
    pub needs_fetch: bool,
    pub needs_processing: bool,
}

impl<T> CascadeNode<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            needs_fetch: true,
            needs_processing: true,
        }
    }

    pub fn without_fetch(mut self) -> Self {
        self.needs_fetch = false;
        self
    }

    pub fn without_processing(mut self) -> Self {
        self.needs_processing = false;
        self
    }
}

impl<T: Default> Default for CascadeNode<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An already-resolved dependency outside the component being processed
#[derive(Debug, Clone)]
pub struct CascadePrior<F, R, E> {
    pub key: String,
    pub edge: E,
    pub fetch: Option<F>,
    pub result: R,
}

#[derive(Debug, Clone)]
pub struct ProcessArgs<T, F, R, E> {
    pub key: String,
    pub template: T,
    pub fetch: Option<F>,
    pub priors: Vec<CascadePrior<F, R, E>>,
}

#[derive(Debug, Clone)]
pub struct CircularMember<T, F> {
    pub key: String,
    pub template: T,
    pub fetch: Option<F>,
}

/// A cyclic component resolved as one unit
#[derive(Debug, Clone)]
pub struct CircularArgs<T, F, R, E> {
    pub keys: Vec<String>,
    pub members: Vec<CircularMember<T, F>>,
    pub priors: Vec<CascadePrior<F, R, E>>,
}

#[derive(Debug, Clone)]
struct Resolved<F, R> {
    fetch: Option<F>,
    result: R,
}

type FetchFn<T, F> =
    Arc<dyn Fn(Vec<(String, T)>) -> BoxFuture<'static, Result<HashMap<String, F>>> + Send + Sync>;
type ProcessFn<T, F, R, E> =
    Arc<dyn Fn(ProcessArgs<T, F, R, E>) -> BoxFuture<'static, Result<R>> + Send + Sync>;
type CircularFn<T, F, R, E> =
    Arc<dyn Fn(CircularArgs<T, F, R, E>) -> BoxFuture<'static, Result<R>> + Send + Sync>;

pub struct CascadeGraph<T, F, R, E> {
    template: Graph<CascadeNode<T>, E>,
    fetch: FetchFn<T, F>,
    process: ProcessFn<T, F, R, E>,
    circular: Option<CircularFn<T, F, R, E>>,
}

impl<T, F, R, E> CascadeGraph<T, F, R, E>
where
    T: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    R: Clone + Default + From<F> + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<FF, PF>(template: Graph<CascadeNode<T>, E>, fetch: FF, process: PF) -> Self
    where
        FF: Fn(Vec<(String, T)>) -> BoxFuture<'static, Result<HashMap<String, F>>> + Send + Sync + 'static,
        PF: Fn(ProcessArgs<T, F, R, E>) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
    {
        Self {
            template,
            fetch: Arc::new(fetch),
            process: Arc::new(process),
            circular: None,
        }
    }

    pub fn with_circular<CF>(mut self, circular: CF) -> Self
    where
        CF: Fn(CircularArgs<T, F, R, E>) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
    {
        self.circular = Some(Arc::new(circular));
        self
    }

    pub fn template(&self) -> &Graph<CascadeNode<T>, E> {
        &self.template
    }

    /// Evaluate every node. Returns each node's result; members of a cyclic
    /// component share the component's single result.
    pub async fn execute(&self) -> Result<HashMap<String, R>> {
        let generations = self.template.generation_order()?;
        let (components, _) = self.template.component_dependencies()?;

        if self.circular.is_none() {
            if let Some(cycle) = components.iter().find(|c| c.len() > 1) {
                return Err(GraphError::CircularComponent(cycle.clone()));
            }
        }

        let mut generation_of = Vec::with_capacity(components.len());
        let mut fetches = Vec::with_capacity(generations.len());
        for (idx, generation) in generations.iter().enumerate() {
            generation_of.extend(std::iter::repeat(idx).take(generation.len()));

            let requests: Vec<(String, T)> = generation
                .iter()
                .flatten()
                .filter_map(|key| {
                    let node = self.template.node_data(key)?;
                    node.needs_fetch.then(|| (key.clone(), node.data.clone()))
                })
                .collect();
            let fetch = Arc::clone(&self.fetch);
            let batch: SharedResult<Arc<HashMap<String, F>>> = async move {
                if requests.is_empty() {
                    return Ok(Arc::new(HashMap::new()));
                }
                Ok(Arc::new(fetch(requests).await?))
            }
            .boxed()
            .shared();
            fetches.push(batch);
        }

        let mut component_of: HashMap<&str, usize> = HashMap::new();
        for (idx, component) in components.iter().enumerate() {
            for key in component {
                component_of.insert(key, idx);
            }
        }

        let mut promises: Vec<SharedResult<Arc<HashMap<String, Resolved<F, R>>>>> =
            Vec::with_capacity(components.len());

        for (idx, keys) in components.iter().enumerate() {
            // (upstream key, edge data, upstream component promise)
            let incoming: Vec<(String, E, SharedResult<Arc<HashMap<String, Resolved<F, R>>>>)> = self
                .template
                .edges()
                .iter()
                .filter(|e| {
                    component_of[e.to.as_str()] == idx && component_of[e.from.as_str()] != idx
                })
                .map(|e| {
                    let source = component_of[e.from.as_str()];
                    (e.from.clone(), e.data.clone(), promises[source].clone())
                })
                .collect();

            let members: Vec<(String, CascadeNode<T>)> = keys
                .iter()
                .filter_map(|k| Some((k.clone(), self.template.node_data(k)?.clone())))
                .collect();
            let generation_fetch = fetches[generation_of[idx]].clone();
            let process = Arc::clone(&self.process);
            let circular = self.circular.clone();
            let keys = keys.clone();

            let promise = async move {
                let fetched = generation_fetch.await?;
                let mut priors = Vec::with_capacity(incoming.len());
                for (key, edge, dep) in incoming {
                    let resolved = dep.await?;
                    if let Some(found) = resolved.get(&key) {
                        priors.push(CascadePrior {
                            key,
                            edge,
                            fetch: found.fetch.clone(),
                            result: found.result.clone(),
                        });
                    }
                }

                let mut out = HashMap::new();
                if keys.len() > 1 {
                    let circular = circular.ok_or_else(|| GraphError::CircularComponent(keys.clone()))?;
                    let members: Vec<CircularMember<T, F>> = members
                        .into_iter()
                        .map(|(key, node)| CircularMember {
                            fetch: fetched.get(&key).cloned(),
                            key,
                            template: node.data,
                        })
                        .collect();
                    let fetch_by_key: HashMap<String, Option<F>> =
                        members.iter().map(|m| (m.key.clone(), m.fetch.clone())).collect();
                    let result = circular(CircularArgs {
                        keys: keys.clone(),
                        members,
                        priors,
                    })
                    .await?;
                    for (key, fetch) in fetch_by_key {
                        out.insert(key, Resolved { fetch, result: result.clone() });
                    }
                } else {
                    for (key, node) in members {
                        let fetch = fetched.get(&key).cloned();
                        let result = if node.needs_processing {
                            process(ProcessArgs {
                                key: key.clone(),
                                template: node.data,
                                fetch: fetch.clone(),
                                priors: priors.clone(),
                            })
                            .await?
                        } else {
                            fetch.clone().map(R::from).unwrap_or_default()
                        };
                        out.insert(key, Resolved { fetch, result });
                    }
                }
                Ok(Arc::new(out))
            }
            .boxed()
            .shared();
            promises.push(promise);
        }

        let mut results = HashMap::new();
        for settled in join_all(promises).await {
            for (key, resolved) in settled?.iter() {
                results.insert(key.clone(), resolved.result.clone());
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphEdge;
    use std::sync::Mutex;

    fn template(edges: &[(&str, &str)]) -> Graph<CascadeNode<i64>, String> {
        let mut graph = Graph::new(true);
        for (from, to) in edges {
            graph.add_edge(GraphEdge::new(*from, *to, format!("{from}->{to}")));
        }
        graph
    }

    fn fetch_lengths(
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    ) -> impl Fn(Vec<(String, i64)>) -> BoxFuture<'static, Result<HashMap<String, i64>>> + Send + Sync {
        move |nodes| {
            calls
                .lock()
                .unwrap()
                .push(nodes.iter().map(|(k, _)| k.clone()).collect());
            async move { Ok(nodes.into_iter().map(|(k, _)| (k.clone(), 10)).collect()) }.boxed()
        }
    }

    fn sum_priors(args: ProcessArgs<i64, i64, i64, String>) -> BoxFuture<'static, Result<i64>> {
        let total = args.fetch.unwrap_or_default() + args.priors.iter().map(|p| p.result).sum::<i64>();
        async move { Ok(total) }.boxed()
    }

    #[tokio::test]
    async fn test_cascade_acyclic_sums_upstream() {
        // A -> C, B -> C, C -> D
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cascade = CascadeGraph::new(
            template(&[("A", "C"), ("B", "C"), ("C", "D")]),
            fetch_lengths(Arc::clone(&calls)),
            sum_priors,
        );

        let results = cascade.execute().await.unwrap();
        assert_eq!(results["A"], 10);
        assert_eq!(results["C"], 30);
        assert_eq!(results["D"], 40);

        // One fetch per generation
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_cascade_rejects_cycle_without_handler() {
        let cascade = CascadeGraph::new(
            template(&[("A", "B"), ("B", "C"), ("C", "A"), ("C", "D")]),
            fetch_lengths(Arc::new(Mutex::new(Vec::new()))),
            sum_priors,
        );
        let err = cascade.execute().await.unwrap_err();
        assert_eq!(
            err,
            GraphError::CircularComponent(vec!["A".into(), "B".into(), "C".into()])
        );
    }

    #[tokio::test]
    async fn test_cascade_circular_handler() {
        let circular_calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&circular_calls);
        let priors_seen = Arc::new(Mutex::new(Vec::new()));
        let priors_recorded = Arc::clone(&priors_seen);

        let cascade = CascadeGraph::new(
            template(&[("A", "B"), ("B", "C"), ("C", "A"), ("C", "D")]),
            fetch_lengths(Arc::new(Mutex::new(Vec::new()))),
            move |args: ProcessArgs<i64, i64, i64, String>| {
                priors_recorded
                    .lock()
                    .unwrap()
                    .extend(args.priors.iter().map(|p| (args.key.clone(), p.key.clone(), p.result, p.edge.clone())));
                sum_priors(args)
            },
        )
        .with_circular(move |args: CircularArgs<i64, i64, i64, String>| {
            recorded.lock().unwrap().push(args.keys.clone());
            async move { Ok(-1) }.boxed()
        });

        let results = cascade.execute().await.unwrap();

        let calls = circular_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        assert_eq!(results["A"], -1);
        assert_eq!(results["B"], -1);

        let priors = priors_seen.lock().unwrap();
        assert_eq!(
            *priors,
            vec![("D".to_string(), "C".to_string(), -1, "C->D".to_string())]
        );
        assert_eq!(results["D"], 9);
    }

    #[tokio::test]
    async fn test_cascade_opt_outs() {
        let mut graph = template(&[("A", "B")]);
        graph.set_node("A", |n| n.needs_processing = false);
        graph.set_node("B", |n| n.needs_fetch = false);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let cascade = CascadeGraph::new(graph, fetch_lengths(Arc::clone(&calls)), sum_priors);
        let results = cascade.execute().await.unwrap();

        // A short-circuits to its fetched value; B is never fetched
        assert_eq!(results["A"], 10);
        assert_eq!(results["B"], 10);
        assert_eq!(*calls.lock().unwrap(), vec![vec!["A".to_string()]]);
    }
}
