//! The allow-set derived from a closure, keyed by top-level store names.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;

/// Immutable set of top-level store entries a mount may reveal.
///
/// Built once from the resolved closure before serving begins; afterwards it
/// is only ever read, so it can be shared freely between request workers
/// without locking. Access control is coarse: once a top-level name is
/// permitted, everything beneath it is fully visible.
#[derive(Debug, Default)]
pub struct AccessPolicy {
    names: HashSet<String>,
}

impl AccessPolicy {
    /// Derive the policy from closure members.
    ///
    /// Each member has the `store_root` prefix stripped and its first
    /// remaining path segment recorded. Members outside the store root are
    /// ignored; the daemon only ever hands out store paths, so such entries
    /// indicate a mismatched `--store-path`.
    pub fn from_closure<I, P>(store_root: &Path, closure: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut policy = Self::default();
        for path in closure {
            match top_level_name(store_root, Path::new(path.as_ref())) {
                Some(name) => policy.allow(name),
                None => tracing::warn!(path = path.as_ref(), "closure member outside the store root"),
            }
        }
        policy
    }

    /// Permit one additional top-level name.
    pub fn allow(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// Whether `rel` (relative to the store root) may be revealed.
    ///
    /// The store root itself is always visible; everything else is decided
    /// by its first path segment alone.
    pub fn permits(&self, rel: &Path) -> bool {
        match rel.components().next() {
            None => true,
            Some(first) => self.permits_name(first.as_os_str()),
        }
    }

    /// Whether a single top-level `name` is permitted.
    pub fn permits_name(&self, name: &OsStr) -> bool {
        name.to_str().map_or(false, |name| self.names.contains(name))
    }

    /// Number of permitted top-level names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when nothing is permitted.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// First path segment of `path` once the store root prefix is stripped.
fn top_level_name<'p>(store_root: &Path, path: &'p Path) -> Option<&'p str> {
    let rel = path.strip_prefix(store_root).ok()?;
    rel.components().next()?.as_os_str().to_str()
}
