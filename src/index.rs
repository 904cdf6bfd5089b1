use std::ops::RangeBounds;

use parking_lot::{RwLock, RwLockReadGuard};
use triomphe::Arc;

use crate::{
    art::Art,
    error::Error,
    options::ArtOptions,
    pool::AllocatorSet,
    repr::RowId,
};

/// A shareable [Art].
///
/// Writers are serialized while readers proceed concurrently. Vacuums hold the write lock
/// for their whole duration. Clones refer to the same index.
#[derive(Debug, Clone, Default)]
pub struct ArtIndex {
    inner: Arc<RwLock<Art>>,
}

impl ArtIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(opts: ArtOptions) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(RwLock::new(Art::with_options(opts)?)),
        })
    }

    pub fn insert(&self, key: &[u8], row_id: RowId) -> Result<bool, Error> {
        self.inner.write().insert(key, row_id)
    }

    pub fn delete(&self, key: &[u8], row_id: RowId) -> Result<bool, Error> {
        self.inner.write().delete(key, row_id)
    }

    /// Applies a batch of inserts under a single write lock, stopping at the first error.
    pub fn insert_many<'k>(
        &self,
        entries: impl IntoIterator<Item = (&'k [u8], RowId)>,
    ) -> Result<usize, Error> {
        let mut art = self.inner.write();
        let mut inserted = 0;
        for (key, row_id) in entries {
            inserted += art.insert(key, row_id)? as usize;
        }
        Ok(inserted)
    }

    pub fn get(&self, key: &[u8]) -> Vec<RowId> {
        self.inner.read().get(key)
    }

    pub fn contains(&self, key: &[u8], row_id: RowId) -> bool {
        self.inner.read().contains(key, row_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Collects the `(key, row id)` pairs with keys in `bounds`.
    pub fn range<K: AsRef<[u8]>>(&self, bounds: impl RangeBounds<K>) -> Vec<(Vec<u8>, RowId)> {
        self.inner.read().range(bounds).collect()
    }

    /// Read access to the underlying tree, e.g. for lazy iteration.
    /// Writers are blocked while the guard is alive.
    pub fn read(&self) -> RwLockReadGuard<'_, Art> {
        self.inner.read()
    }

    pub fn vacuum(&self) -> Result<AllocatorSet, Error> {
        self.inner.write().vacuum()
    }

    pub fn verify(&self) -> Result<(), Error> {
        self.inner.read().verify()
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.read().memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ArtKey;

    #[test]
    fn test_concurrent_readers() {
        let index = ArtIndex::new();
        let keys = (0..1000u32).map(ArtKey::from).collect::<Vec<_>>();
        let entries = keys.iter().enumerate().map(|(i, k)| (k.as_bytes(), i as RowId));
        assert_eq!(index.insert_many(entries).unwrap(), 1000);

        std::thread::scope(|s| {
            for t in 0..4 {
                let index = index.clone();
                let keys = &keys;
                s.spawn(move || {
                    for (i, key) in keys.iter().enumerate().skip(t).step_by(4) {
                        // the writer below may have added a second row id
                        assert_eq!(index.get(key)[0], i as RowId);
                    }
                });
            }
            s.spawn(|| {
                for (i, key) in keys.iter().enumerate().step_by(2) {
                    index.insert(key, i as RowId + 1000).unwrap();
                }
            });
        });
        assert_eq!(index.len(), 1500);
        assert_eq!(index.read().iter().count(), 1500);
        index.vacuum().unwrap();
        index.verify().unwrap();
    }
}
