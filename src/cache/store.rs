//! Provides the content-addressed store for response bodies.
//!
//! Bodies are keyed by a digest of their bytes instead of by URI. Distinct URIs regularly
//! yield the exact same body (shared assets, error pages, empty responses) and storing each
//! copy once can shrink the cache considerably. Each stored body carries a reference count of
//! how many cached headers currently point at it - a body is only dropped once the last
//! referencing header has been evicted.
//!
//! Note that a header referencing a digest which is absent from this store is a bookkeeping
//! defect, never a normal condition. Lookups through [ContentStore::get](ContentStore::get)
//! therefore must not silently treat absence as a cache miss (see
//! [CacheError::InvariantViolation](crate::cache::CacheError)).
use std::fmt;
use std::hash::Hasher;

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHasher};

use crate::cache::accounting::ByteEstimate;
use crate::cache::CacheError;

/// A content digest used to address response bodies.
///
/// Equal body bytes always yield equal digests. We use 64 bit FNV-1a which is plenty for the
/// number of bodies a memory-bounded cache can hold at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Digest(u64);

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Computes the content digest of the given body bytes.
///
/// # Examples
/// ```
/// # use mercury::cache::store::digest;
/// // Equal bytes yield equal digests...
/// assert_eq!(digest(b"hello"), digest(b"hello"));
///
/// // ...different bytes (virtually always) different ones.
/// assert_ne!(digest(b"hello"), digest(b"world"));
/// ```
pub fn digest(bytes: &[u8]) -> Digest {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    Digest(hasher.finish())
}

/// A stored response body along with the number of cached headers referencing it.
pub struct CachedBody {
    bytes: Bytes,
    ref_count: usize,
}

impl CachedBody {
    /// Provides access to the body bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the number of cached headers currently referencing this body.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Returns the estimate a stored body with the given payload length is charged with.
    ///
    /// The cache uses this to price a body before it is actually stored. It has to match
    /// [estimated_size](ByteEstimate::estimated_size) exactly, as the charge computed here is
    /// credited via the estimate when the body is freed.
    pub fn estimate_for(payload_len: usize) -> usize {
        payload_len + std::mem::size_of::<CachedBody>()
    }
}

impl ByteEstimate for CachedBody {
    fn estimated_size(&self) -> usize {
        CachedBody::estimate_for(self.bytes.len())
    }
}

/// Maps content digests to reference counted response bodies.
#[derive(Default)]
pub struct ContentStore {
    bodies: FnvHashMap<Digest, CachedBody>,
}

impl ContentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        ContentStore {
            bodies: FnvHashMap::default(),
        }
    }

    /// Returns the body stored for the given digest (if any).
    pub fn get(&self, digest: Digest) -> Option<&CachedBody> {
        self.bodies.get(&digest)
    }

    /// Determines if a body for the given digest is present.
    pub fn contains(&self, digest: Digest) -> bool {
        self.bodies.contains_key(&digest)
    }

    /// Registers another reference to the body with the given digest.
    ///
    /// If the digest is already present, its reference count is incremented and the supplied
    /// bytes (if any) are ignored. Otherwise a new entry with a reference count of 1 is
    /// created from the given bytes. A true miss without bytes is a defect in the caller's
    /// bookkeeping and reported as such.
    pub fn acquire(
        &mut self,
        digest: Digest,
        bytes_if_new: Option<Bytes>,
    ) -> Result<&CachedBody, CacheError> {
        if let Some(body) = self.bodies.get_mut(&digest) {
            body.ref_count += 1;
            return Ok(&self.bodies[&digest]);
        }

        match bytes_if_new {
            Some(bytes) => {
                let _ = self.bodies.insert(
                    digest,
                    CachedBody {
                        bytes,
                        ref_count: 1,
                    },
                );
                Ok(&self.bodies[&digest])
            }
            None => Err(CacheError::InvariantViolation(format!(
                "Tried to acquire the unknown body {} without supplying its bytes.",
                digest
            ))),
        }
    }

    /// Releases one reference to the body with the given digest.
    ///
    /// If the last reference is released, the body is removed and its estimated size is
    /// returned so that the caller can credit it against the occupancy. Releasing an absent
    /// digest is a no-op.
    pub fn release(&mut self, digest: Digest) -> Option<usize> {
        let body = self.bodies.get_mut(&digest)?;

        if body.ref_count > 1 {
            body.ref_count -= 1;
            None
        } else {
            self.bodies
                .remove(&digest)
                .map(|body| body.estimated_size())
        }
    }

    /// Returns the number of distinct bodies currently stored.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::accounting::ByteEstimate;
    use crate::cache::store::{digest, ContentStore};
    use crate::cache::CacheError;
    use bytes::Bytes;

    #[test]
    fn acquire_deduplicates_equal_bodies() {
        let mut store = ContentStore::new();
        let body = Bytes::from_static(b"shared body");
        let key = digest(&body);

        // The first acquire creates the entry...
        let created = store.acquire(key, Some(body.clone())).unwrap();
        assert_eq!(created.ref_count(), 1);

        // ...subsequent acquires only bump the reference count.
        let shared = store.acquire(key, None).unwrap();
        assert_eq!(shared.ref_count(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn acquire_without_bytes_for_a_miss_is_a_defect() {
        let mut store = ContentStore::new();
        let key = digest(b"never stored");

        match store.acquire(key, None) {
            Err(CacheError::InvariantViolation(_)) => (),
            _ => panic!("Expected an invariant violation!"),
        }
    }

    #[test]
    fn release_frees_the_body_with_the_last_reference() {
        let mut store = ContentStore::new();
        let body = Bytes::from_static(b"shared body");
        let key = digest(&body);
        let expected_size = {
            let created = store.acquire(key, Some(body.clone())).unwrap();
            created.estimated_size()
        };
        let _ = store.acquire(key, None).unwrap();

        // The first release keeps the still referenced body around...
        assert_eq!(store.release(key), None);
        assert_eq!(store.contains(key), true);

        // ...the second one removes it and reports the freed size.
        assert_eq!(store.release(key), Some(expected_size));
        assert_eq!(store.is_empty(), true);

        // Releasing an unknown digest is a silent no-op.
        assert_eq!(store.release(key), None);
    }
}
