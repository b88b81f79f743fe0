//! A single-lookahead directory cursor that filters the store root.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::node::{DirEntry, Errno, RawDirStream};
use crate::policy::AccessPolicy;

/// Filtered view over a raw directory stream.
///
/// Only the store root itself is filtered: entries whose name the policy
/// does not permit are silently skipped there, while deeper directories pass
/// through untouched. The cursor keeps at most one pulled-ahead entry plus a
/// terminal errno, so `has_next` never consumes state `next` would observe.
/// All of that state lives behind a mutex because the kernel may drive one
/// open directory handle from several worker threads.
pub struct FilteredDirStream {
    state: Mutex<State>,
    policy: Arc<AccessPolicy>,
    at_store_root: bool,
}

struct State {
    raw: Box<dyn RawDirStream>,
    lookahead: Option<DirEntry>,
    /// Terminal status; 0 is a clean end of stream.
    errno: Errno,
}

impl FilteredDirStream {
    /// Wrap `raw`; entries are filtered iff `rel` names the store root.
    pub fn new(raw: Box<dyn RawDirStream>, policy: Arc<AccessPolicy>, rel: &Path) -> Self {
        Self {
            state: Mutex::new(State {
                raw,
                lookahead: None,
                errno: 0,
            }),
            policy,
            at_store_root: rel.as_os_str().is_empty(),
        }
    }

    /// Pull ahead until a visible entry, the end, or an error.
    fn load(&self, state: &mut State) {
        if state.lookahead.is_some() {
            return;
        }
        loop {
            match state.raw.next_entry() {
                Ok(Some(entry)) => {
                    if self.at_store_root && !self.policy.permits_name(&entry.name) {
                        continue;
                    }
                    state.lookahead = Some(entry);
                    return;
                }
                Ok(None) => {
                    state.errno = 0;
                    return;
                }
                Err(errno) => {
                    state.errno = errno;
                    return;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another entry is available.
    pub fn has_next(&self) -> bool {
        let mut state = self.lock();
        self.load(&mut state);
        state.lookahead.is_some()
    }

    /// The next entry, `Ok(None)` at a clean end, or the terminal errno.
    pub fn next(&self) -> Result<Option<DirEntry>, Errno> {
        let mut state = self.lock();
        self.load(&mut state);
        match state.lookahead.take() {
            Some(entry) => Ok(Some(entry)),
            None if state.errno == 0 => Ok(None),
            None => Err(state.errno),
        }
    }

    /// Reposition the cursor; filtering restarts from the new position.
    pub fn seek(&self, offset: i64) -> Result<(), Errno> {
        let mut state = self.lock();
        state.raw.seek(offset)?;
        state.lookahead = None;
        state.errno = 0;
        Ok(())
    }

    /// Forward a directory sync request to the underlying enumerator.
    pub fn sync(&self, datasync: bool) -> Result<(), Errno> {
        let mut state = self.lock();
        state.raw.sync(datasync)
    }
}
