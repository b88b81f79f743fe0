//! Transitive reference closure of a store path.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use crate::client::DaemonClient;
use crate::error::Result;

/// Resolve the set of store paths transitively reachable from `root`.
///
/// Iterative worklist traversal: pop a path, skip it when already visited,
/// otherwise query its info and enqueue every reference. De-duplication
/// happens at pop time, so cycles and diamond-shaped reference graphs
/// terminate and each distinct path is queried exactly once. Any query
/// failure aborts the resolution.
pub fn closure<S: Read + Write>(
    client: &mut DaemonClient<S>,
    root: &str,
) -> Result<BTreeSet<String>> {
    let mut visited = BTreeSet::new();
    let mut queue = vec![root.to_owned()];

    while let Some(path) = queue.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let info = client.query_path_info(&path)?;
        tracing::debug!(%path, references = info.references.len(), "resolved");
        queue.extend(info.references);
    }

    tracing::debug!(paths = visited.len(), "closure complete");
    Ok(visited)
}
