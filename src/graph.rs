//! Code-graph provider seam.
//!
//! Indexing is owned by an external collaborator; the core only asks for
//! an index id and whether the provider is usable at all.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// Behavioural contract for the code-graph indexer.
#[async_trait]
pub trait GraphProvider: Send + Sync {
    /// Initialise (or reuse) an index for a project root, returning its id.
    async fn initialize(&self, project_root: &Path) -> Result<String>;

    /// Whether the provider can serve requests right now.
    fn is_available(&self) -> bool;
}

/// Provider used when no graph backend is wired in; INIT will route the
/// session into degraded mode.
#[derive(Debug, Clone, Default)]
pub struct UnavailableGraph;

#[async_trait]
impl GraphProvider for UnavailableGraph {
    async fn initialize(&self, _project_root: &Path) -> Result<String> {
        Err(crate::error::Error::permanent(
            "graph",
            "no graph provider configured",
        ))
    }

    fn is_available(&self) -> bool {
        false
    }
}
