//! Serving graph collaborator.

use crate::error::Result;
use std::fmt;

/// Rebuilds the externally visible serving graph from the topology.
#[async_trait::async_trait]
pub trait ServingGraph: Send + Sync + fmt::Debug {
    /// Rebuild every shard of a keyspace in `cells`, or in all cells when
    /// `cells` is `None`.
    async fn rebuild_keyspace_graph(
        &self,
        keyspace: &str,
        cells: Option<&[String]>,
        force: bool,
    ) -> Result<()>;

    /// Rebuild the serving records of one shard.
    async fn rebuild_shard_graph(&self, keyspace: &str, shard: &str) -> Result<()>;
}
