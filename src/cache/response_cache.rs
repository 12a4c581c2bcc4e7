//! Provides the response cache itself, tying index, store, queue and accounting together.
//!
//! The cache composes the [HeaderIndex](crate::cache::index::HeaderIndex), the
//! [ContentStore](crate::cache::store::ContentStore), the
//! [EvictionQueue](crate::cache::queue::EvictionQueue) and the
//! [SizeAccountant](crate::cache::accounting::SizeAccountant) into three public operations:
//! `has`, `get` and `add`. Before every insertion, the oldest entries are evicted until the
//! new entry fits into the configured memory budget.
//!
//! All state lives behind a single mutex. Especially `add` performs a read-modify-write
//! sequence (check the budget, evict, insert, update the occupancy) which must never
//! interleave with another `add`: two racing insertions could both conclude that no eviction
//! is required and jointly overrun the budget, or could release the same body twice. Each
//! operation therefore executes as one critical section. Eviction runs entirely inside that
//! section and is bounded by the number of queued records, so no lock is ever held for an
//! unbounded time.
use std::sync::Mutex;

use crate::cache::accounting::{ByteEstimate, SizeAccountant};
use crate::cache::index::{CachedHeader, HeaderIndex};
use crate::cache::queue::EvictionQueue;
use crate::cache::store::{digest, CachedBody, ContentStore, Digest};
use crate::cache::CacheError;
use crate::fmt::format_size;
use crate::response::{CachePolicy, Response};

/// A size-bounded, content-addressed cache for HTTP responses.
///
/// # Examples
/// ```
/// # use mercury::cache::ResponseCache;
/// # use mercury::response::{CachePolicy, Response};
/// # use bytes::Bytes;
/// # use std::collections::HashSet;
/// let policy = CachePolicy::new(
///     HashSet::from([200]),
///     HashSet::from(["text/html".to_owned()]),
/// );
/// let cache = ResponseCache::new(64 * 1024, policy, false);
///
/// let response = Response::new(
///     200,
///     "OK",
///     vec![("content-type".to_owned(), "text/html".to_owned())],
///     Bytes::from_static(b"<html>Hello</html>"),
/// );
///
/// // The policy admits the response, so we cache it...
/// assert_eq!(cache.admits(&response), true);
/// cache.add("http://example.com/", &response).unwrap();
///
/// // ...and can serve it back without asking the origin server again.
/// assert_eq!(cache.has("http://example.com/"), true);
/// assert_eq!(cache.get("http://example.com/").unwrap(), response);
/// ```
pub struct ResponseCache {
    policy: CachePolicy,
    verbose: bool,
    state: Mutex<CacheState>,
}

/// The complete mutable state of the cache, guarded by a single lock.
struct CacheState {
    index: HeaderIndex,
    store: ContentStore,
    queue: EvictionQueue,
    accountant: SizeAccountant,
    next_sequence: u64,
    hits: usize,
    misses: usize,
    insertions: usize,
    evictions: usize,
    rejections: usize,
}

/// A point-in-time snapshot of the cache metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    /// The number of URIs currently cached.
    pub entries: usize,
    /// The number of distinct bodies currently stored.
    pub bodies: usize,
    /// The estimated number of bytes currently occupied.
    pub occupancy: usize,
    /// The configured memory budget in bytes.
    pub budget: usize,
    /// The number of `get` calls which were answered from the cache.
    pub hits: usize,
    /// The number of `get` calls for URIs which were not cached.
    pub misses: usize,
    /// The number of entries stored so far.
    pub insertions: usize,
    /// The number of entries evicted to make room so far.
    pub evictions: usize,
    /// The number of entries rejected because they exceed the whole budget.
    pub rejections: usize,
}

impl Stats {
    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.hits + self.misses {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }

    /// Returns the memory utilization in percent.
    pub fn memory_utilization(&self) -> f32 {
        match self.budget {
            0 => 100.,
            budget => self.occupancy as f32 / budget as f32 * 100.,
        }
    }
}

impl ResponseCache {
    /// Creates a new cache with the given memory budget in bytes.
    ///
    /// The given policy decides which responses [admits](ResponseCache::admits) accepts. If
    /// **verbose** is set, every insertion and eviction emits a diagnostic log message.
    pub fn new(budget: usize, policy: CachePolicy, verbose: bool) -> Self {
        ResponseCache {
            policy,
            verbose,
            state: Mutex::new(CacheState {
                index: HeaderIndex::new(),
                store: ContentStore::new(),
                queue: EvictionQueue::new(),
                accountant: SizeAccountant::new(budget),
                next_sequence: 0,
                hits: 0,
                misses: 0,
                insertions: 0,
                evictions: 0,
                rejections: 0,
            }),
        }
    }

    /// Determines if the cache policy admits the given response.
    ///
    /// Note that this is a pure policy check - whether the response also fits into the budget
    /// is only determined by [add](ResponseCache::add).
    pub fn admits(&self, response: &Response) -> bool {
        response.is_cacheable(&self.policy)
    }

    /// Determines if a response for the given URI is cached.
    pub fn has(&self, uri: &str) -> bool {
        self.state.lock().unwrap().index.has(uri)
    }

    /// Stores the given response for the given URI.
    ///
    /// If the URI is already cached, the previous entry is replaced (last write wins). Before
    /// the insertion, the oldest entries are evicted until the new entry fits into the
    /// budget.
    ///
    /// # Errors
    /// Fails with [CacheError::EntryTooLarge](CacheError::EntryTooLarge) if the entry alone
    /// exceeds the whole budget. In this case the cache remains unchanged and the caller
    /// should simply serve the response uncached.
    pub fn add(&self, uri: &str, response: &Response) -> Result<(), CacheError> {
        let body_digest = digest(response.body());

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let header = CachedHeader::new(response, body_digest, sequence);
        let header_size = header.estimated_size();
        // The URI is charged twice as both the index and the eviction queue store it...
        let uri_size = uri.estimated_size();

        // Evict the oldest entries until the incremental footprint fits. The footprint has to
        // be re-computed after every eviction round: the body is only charged if its digest
        // is not stored yet, and evictions can free exactly that body in the meantime.
        let incremental = loop {
            let incremental =
                incremental_size(state, uri_size, header_size, body_digest, response);

            if incremental > state.accountant.budget() {
                state.rejections += 1;
                log::info!(
                    "Not caching {}: the entry ({}) exceeds the whole cache budget ({}).",
                    uri,
                    format_size(incremental),
                    format_size(state.accountant.budget())
                );
                return Err(CacheError::EntryTooLarge);
            }

            if incremental <= state.accountant.remaining() {
                break incremental;
            }

            if !evict_oldest(state, self.verbose) {
                // The queue has run dry and the entry still does not fit...
                state.rejections += 1;
                return Err(CacheError::EntryTooLarge);
            }
        };

        // Acquire the body first: if the previous entry for this URI references the same
        // digest, releasing it below must not free the body we are about to share.
        let body_is_new = !state.store.contains(body_digest);
        let _ = state
            .store
            .acquire(body_digest, body_is_new.then(|| response.body().clone()))?;

        let previous = state.index.put(uri.to_owned(), header);
        state.queue.push(uri.to_owned(), sequence);
        state.accountant.charge(incremental);
        state.insertions += 1;

        if let Some(old) = previous {
            // Replacement: the old header is gone, so its charges (header, index key and
            // queue record) are credited now. Its queue record stays behind as a
            // zero-charge ghost which eviction will skip later on.
            let mut credit = old.estimated_size() + 2 * uri_size;
            if let Some(freed) = state.store.release(old.digest()) {
                credit += freed;
            }
            if !state.accountant.credit(credit) {
                log::error!(
                    "Cache accounting underflow while replacing {} - the occupancy was clamped to zero.",
                    uri
                );
            }
        }

        if self.verbose {
            log::debug!(
                "Cached {} ({}). Cache occupancy: {} of {}.",
                uri,
                format_size(incremental),
                format_size(state.accountant.occupancy()),
                format_size(state.accountant.budget())
            );
        }

        Ok(())
    }

    /// Reconstructs the cached response for the given URI.
    ///
    /// # Errors
    /// Fails with [CacheError::NotFound](CacheError::NotFound) if no response is cached for
    /// the URI - for the proxy this simply means "fetch from the origin server". Fails with
    /// [CacheError::InvariantViolation](CacheError::InvariantViolation) if the cached header
    /// references a body which is missing from the content store. The latter indicates a
    /// bookkeeping defect and is logged, but it does not poison the remaining entries.
    pub fn get(&self, uri: &str) -> Result<Response, CacheError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let header = match state.index.get(uri) {
            Some(header) => header,
            None => {
                state.misses += 1;
                return Err(CacheError::NotFound);
            }
        };

        let body = match state.store.get(header.digest()) {
            Some(body) => body,
            None => {
                log::error!(
                    "The cached header for {} references the body {} which is missing from the content store!",
                    uri,
                    header.digest()
                );
                return Err(CacheError::InvariantViolation(format!(
                    "The body {} for {} is missing from the content store.",
                    header.digest(),
                    uri
                )));
            }
        };

        let response = Response::new(
            header.status(),
            header.reason(),
            header.headers().to_vec(),
            body.bytes().clone(),
        );
        state.hits += 1;

        Ok(response)
    }

    /// Returns the number of URIs currently cached.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().index.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().index.is_empty()
    }

    /// Returns the estimated number of bytes currently occupied by the cache.
    pub fn occupancy(&self) -> usize {
        self.state.lock().unwrap().accountant.occupancy()
    }

    /// Returns the configured memory budget in bytes.
    pub fn budget(&self) -> usize {
        self.state.lock().unwrap().accountant.budget()
    }

    /// Returns a snapshot of the cache metrics.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock().unwrap();
        Stats {
            entries: state.index.len(),
            bodies: state.store.len(),
            occupancy: state.accountant.occupancy(),
            budget: state.accountant.budget(),
            hits: state.hits,
            misses: state.misses,
            insertions: state.insertions,
            evictions: state.evictions,
            rejections: state.rejections,
        }
    }
}

/// Computes the incremental footprint of inserting the given entry right now.
///
/// The URI is charged twice (index key and queue record), the body only if its digest is not
/// stored yet.
fn incremental_size(
    state: &CacheState,
    uri_size: usize,
    header_size: usize,
    body_digest: Digest,
    response: &Response,
) -> usize {
    let mut size = 2 * uri_size + header_size;
    if !state.store.contains(body_digest) {
        size += CachedBody::estimate_for(response.body().len());
    }
    size
}

/// Evicts the oldest live entry, skipping any ghost records on the way.
///
/// Returns **false** once the queue has run dry without finding a live entry, in which case
/// the cache is empty and no further room can be made.
fn evict_oldest(state: &mut CacheState, verbose: bool) -> bool {
    loop {
        let record = match state.queue.pop_oldest() {
            Some(record) => record,
            None => return false,
        };

        // A record whose sequence number no longer matches the indexed header is a ghost:
        // the URI was overwritten after this record was pushed and all of its charges were
        // already credited back then. Skipping it must not touch the accounting.
        let is_live = state
            .index
            .get(&record.uri)
            .map(|header| header.sequence() == record.sequence)
            .unwrap_or(false);
        if !is_live {
            if verbose {
                log::debug!("Skipping ghost record for {}...", &record.uri);
            }
            continue;
        }

        let header = match state.index.remove(&record.uri) {
            Some(header) => header,
            None => continue,
        };

        let mut freed = header.estimated_size() + 2 * record.uri.estimated_size();
        if let Some(body_freed) = state.store.release(header.digest()) {
            freed += body_freed;
        }
        if !state.accountant.credit(freed) {
            log::error!(
                "Cache accounting underflow while evicting {} - the occupancy was clamped to zero.",
                &record.uri
            );
        }
        state.evictions += 1;

        if verbose {
            log::debug!(
                "Evicted {} ({} freed). Cache occupancy: {} of {}.",
                &record.uri,
                format_size(freed),
                format_size(state.accountant.occupancy()),
                format_size(state.accountant.budget())
            );
        }

        return true;
    }
}
