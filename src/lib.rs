//! depgraph - denormalized dependency graph over a transactional key-value store
//!
//! # Architecture
//!
//! - **Mirrored rows**: every edge `from -> to` is stored twice, once in the
//!   `Graph::Forward` row of `from` and once in the `Graph::Back` row of `to`
//! - **Reachability caches**: transitive closures written back lazily and
//!   invalidated whenever a direct edge set changes
//! - **Deferred caches**: concurrent readers of the same row share one fetch
//! - **Partitioned commits**: updates larger than one transaction are split
//!   with a Karger-Stein min cut, committed in parallel, then the cut set
//! - **Optimistic concurrency**: conditional writes on `updatedAt`, with
//!   bounded retries on conflict
//!
//! # Usage example
//!
//! ```no_run
//! use std::sync::Arc;
//! use depgraph::{Direction, EdgeMutation, FetchOptions, GraphConfig, GraphStore, SledStore};
//!
//! # async fn run() -> depgraph::Result<()> {
//! let handler = Arc::new(SledStore::open("./graph.sled")?);
//! let store = GraphStore::new(handler, GraphConfig::from_env()?)?;
//!
//! store
//!     .update_graph_storage(vec![
//!         EdgeMutation::put("app", "lib", "build"),
//!         EdgeMutation::put("lib", "core", "build"),
//!     ])
//!     .await?;
//!
//! let graph = store.get_graph(&["app".to_string()], Direction::Forward, FetchOptions::default()).await?;
//! println!("app reaches {} nodes", graph.node_count());
//! store.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod legacy;
pub mod storage;
pub mod store;
pub mod update;


pub use cache::{CacheEdge, DependencyEdge, DirectEdge, Direction, EdgeKey, FetchOptions, GraphNodeResult, NodeEdges};
pub use config::GraphConfig;
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphEdge};
pub use storage::{Item, ItemKey, MemoryStore, SledStore, StoreHandler, WriteRequest};
pub use store::GraphStore;
pub use update::{EdgeMutation, SetEdgesRequest, UpdateAction};
