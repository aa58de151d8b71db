//! Attachment storage abstraction.
//!
//! The router keeps decrypted image bytes outside the registry so that a
//! host can put them on disk, in memory, or nowhere at all. The trait is
//! synchronous; implementations must not block for long because `purge` is
//! called from the expiry tick.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::identity::AttachmentId;

/// Attachment store failure. Never fatal to the router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    /// Backend refused or failed the operation
    #[error("attachment backend error: {0}")]
    Backend(String),
}

/// Storage for attachment bytes.
///
/// # Invariants
///
/// - After `purge(id)` returns `Ok`, `load(id)` returns `Ok(None)`
/// - `purge` of an unknown id is not an error
pub trait AttachmentStore: Send + Sync + 'static {
    /// Store bytes under `id`, replacing any previous value.
    fn store(&self, id: AttachmentId, bytes: Bytes) -> Result<(), AttachmentError>;

    /// Load bytes for `id`. `None` if absent or purged.
    fn load(&self, id: AttachmentId) -> Result<Option<Bytes>, AttachmentError>;

    /// Delete bytes for `id`. Returns true if anything was removed.
    fn purge(&self, id: AttachmentId) -> Result<bool, AttachmentError>;
}

/// In-memory attachment store.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttachmentStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    blobs: HashMap<AttachmentId, Bytes>,
    purged: u64,
}

impl MemoryAttachmentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored attachments.
    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().blobs.is_empty()
    }

    /// True if `id` is stored.
    pub fn contains(&self, id: AttachmentId) -> bool {
        self.inner.lock().blobs.contains_key(&id)
    }

    /// Number of purges that removed something.
    pub fn purged(&self) -> u64 {
        self.inner.lock().purged
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn store(&self, id: AttachmentId, bytes: Bytes) -> Result<(), AttachmentError> {
        self.inner.lock().blobs.insert(id, bytes);
        Ok(())
    }

    fn load(&self, id: AttachmentId) -> Result<Option<Bytes>, AttachmentError> {
        Ok(self.inner.lock().blobs.get(&id).cloned())
    }

    fn purge(&self, id: AttachmentId) -> Result<bool, AttachmentError> {
        let mut inner = self.inner.lock();
        let removed = inner.blobs.remove(&id).is_some();
        if removed {
            inner.purged += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_removes_once() {
        let store = MemoryAttachmentStore::new();
        store.store(AttachmentId(1), Bytes::from_static(b"png")).unwrap();

        assert!(store.purge(AttachmentId(1)).unwrap());
        assert!(!store.purge(AttachmentId(1)).unwrap());
        assert_eq!(store.load(AttachmentId(1)).unwrap(), None);
        assert_eq!(store.purged(), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryAttachmentStore::new();
        let other = store.clone();
        store.store(AttachmentId(2), Bytes::from_static(b"gif")).unwrap();
        assert!(other.contains(AttachmentId(2)));
    }
}
