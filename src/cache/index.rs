//! Provides the index of cached response headers, keyed by request URI.
//!
//! A [CachedHeader] is everything of a response except its body: status line, header fields
//! and the digest under which the body can be resolved through the
//! [ContentStore](crate::cache::store::ContentStore). The digest is a non-owning reference -
//! the store keeps the body alive via reference counting for as long as at least one header
//! points at it.
use crate::cache::accounting::ByteEstimate;
use crate::cache::store::Digest;
use crate::response::Response;
use fnv::FnvHashMap;

/// A cached response without its body.
///
/// Besides the response metadata, each header carries the insertion sequence number assigned
/// by the cache when it was stored. The eviction queue records the same number, which allows
/// the eviction logic to recognize queue records whose header has been overwritten since (see
/// [crate::cache::queue]).
pub struct CachedHeader {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    digest: Digest,
    sequence: u64,
}

impl CachedHeader {
    /// Creates a cached header from the given response.
    ///
    /// The body is not copied - only its digest is recorded.
    pub fn new(response: &Response, digest: Digest, sequence: u64) -> Self {
        CachedHeader {
            status: response.status(),
            reason: response.reason().to_owned(),
            headers: response.headers().to_vec(),
            digest,
            sequence,
        }
    }

    /// Returns the digest of the body belonging to this header.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Returns the insertion sequence number assigned when this header was stored.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the numeric HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the reason phrase of the status line.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Provides access to the stored header fields.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl ByteEstimate for CachedHeader {
    fn estimated_size(&self) -> usize {
        let fields = self
            .headers
            .iter()
            .map(|(name, value)| name.estimated_size() + value.estimated_size())
            .sum::<usize>();

        fields + self.reason.estimated_size() + std::mem::size_of::<CachedHeader>()
    }
}

/// Maps request URIs to cached response headers.
#[derive(Default)]
pub struct HeaderIndex {
    entries: FnvHashMap<String, CachedHeader>,
}

impl HeaderIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        HeaderIndex {
            entries: FnvHashMap::default(),
        }
    }

    /// Determines if a header for the given URI is present.
    pub fn has(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Returns the header stored for the given URI (if any).
    pub fn get(&self, uri: &str) -> Option<&CachedHeader> {
        self.entries.get(uri)
    }

    /// Stores the given header for the given URI.
    ///
    /// Returns the previously stored header if the URI was already present, so that the
    /// caller can release its body reference and credit its charges (last write wins).
    pub fn put(&mut self, uri: String, header: CachedHeader) -> Option<CachedHeader> {
        self.entries.insert(uri, header)
    }

    /// Removes and returns the header stored for the given URI (used during eviction).
    pub fn remove(&mut self, uri: &str) -> Option<CachedHeader> {
        self.entries.remove(uri)
    }

    /// Returns the number of URIs currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Determines if the index is completely empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::accounting::ByteEstimate;
    use crate::cache::index::{CachedHeader, HeaderIndex};
    use crate::cache::store::digest;
    use crate::response::Response;
    use bytes::Bytes;

    fn example_header(sequence: u64) -> CachedHeader {
        let response = Response::new(
            200,
            "OK",
            vec![("content-type".to_owned(), "text/html".to_owned())],
            Bytes::from_static(b"body"),
        );
        CachedHeader::new(&response, digest(response.body()), sequence)
    }

    #[test]
    fn put_replaces_and_returns_the_previous_header() {
        let mut index = HeaderIndex::new();

        assert_eq!(
            index
                .put("http://example.com/".to_owned(), example_header(1))
                .is_none(),
            true
        );
        assert_eq!(index.has("http://example.com/"), true);
        assert_eq!(index.len(), 1);

        // Overwriting yields the previous header and keeps a single entry...
        let previous = index
            .put("http://example.com/".to_owned(), example_header(2))
            .unwrap();
        assert_eq!(previous.sequence(), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("http://example.com/").unwrap().sequence(), 2);
    }

    #[test]
    fn remove_yields_the_stored_header() {
        let mut index = HeaderIndex::new();
        let _ = index.put("http://example.com/".to_owned(), example_header(1));

        let removed = index.remove("http://example.com/").unwrap();
        assert_eq!(removed.status(), 200);
        assert_eq!(index.is_empty(), true);
        assert_eq!(index.remove("http://example.com/").is_none(), true);
    }

    #[test]
    fn header_estimates_reflect_the_stored_fields() {
        let small = example_header(1);

        let response = Response::new(
            200,
            "OK",
            vec![
                ("content-type".to_owned(), "text/html".to_owned()),
                (
                    "cache-control".to_owned(),
                    "public, max-age=31536000, immutable".to_owned(),
                ),
            ],
            Bytes::from_static(b"body"),
        );
        let large = CachedHeader::new(&response, digest(response.body()), 2);

        assert_eq!(small.estimated_size() < large.estimated_size(), true);
    }
}
