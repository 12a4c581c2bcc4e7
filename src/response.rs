//! Represents an HTTP response as handled by the proxy.
//!
//! A [Response] is what the [upstream](crate::upstream) client produces and what the
//! [cache](crate::cache) stores and reconstructs. It deliberately keeps the header fields as an
//! ordered list of name/value pairs: we want to serialize a cached response to the client
//! byte-for-byte the way the origin server sent it, and a map would lose both ordering and
//! duplicate fields (e.g. multiple **set-cookie** lines).
//!
//! Whether a response may be cached at all is decided by a [CachePolicy] which is built from
//! the system config (see [crate::cache]): only responses with an allow-listed status code
//! **and** an allow-listed content type are admitted.
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt::Write;

/// Represents a complete HTTP response: status line, header fields and body.
///
/// # Examples
/// ```
/// # use mercury::response::Response;
/// # use bytes::Bytes;
/// let response = Response::new(
///     200,
///     "OK",
///     vec![("content-type".to_owned(), "text/html; charset=utf-8".to_owned())],
///     Bytes::from_static(b"<html></html>"),
/// );
///
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.header("Content-Type").unwrap(), "text/html; charset=utf-8");
/// assert_eq!(response.content_type().unwrap(), "text/html");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    /// Creates a new response from the given status, reason phrase, header fields and body.
    pub fn new(
        status: u16,
        reason: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        Response {
            status,
            reason: reason.into(),
            headers,
            body,
        }
    }

    /// Returns the numeric HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the reason phrase of the status line (e.g. "OK" or "Not Found").
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Provides access to the header fields in the order they were received.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Provides access to the body bytes.
    ///
    /// Note that **Bytes** is reference counted, therefore cloning the body to hand it to the
    /// cache or a client connection is cheap.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the first value of the given header field.
    ///
    /// Header names are compared case-insensitively as HTTP demands.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the media type of the response.
    ///
    /// This is the value of the **content-type** field up to the first **;** so that charset
    /// or boundary parameters do not interfere with the cacheability check.
    ///
    /// # Examples
    /// ```
    /// # use mercury::response::Response;
    /// # use bytes::Bytes;
    /// let response = Response::new(
    ///     200,
    ///     "OK",
    ///     vec![("Content-Type".to_owned(), "text/css; charset=iso-8859-1".to_owned())],
    ///     Bytes::new(),
    /// );
    /// assert_eq!(response.content_type().unwrap(), "text/css");
    /// ```
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }

    /// Determines if this response may be stored in the cache as defined by the given policy.
    pub fn is_cacheable(&self, policy: &CachePolicy) -> bool {
        policy.admits(self)
    }

    /// Serializes the response into a buffer which can be written to a client socket in a
    /// single syscall.
    pub fn to_wire(&self) -> Bytes {
        let mut result = String::new();
        let _ = write!(result, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(result, "{}: {}\r\n", name, value);
        }
        result.push_str("\r\n");

        let mut wire = Vec::with_capacity(result.len() + self.body.len());
        wire.extend_from_slice(result.as_bytes());
        wire.extend_from_slice(&self.body);

        Bytes::from(wire)
    }
}

/// Determines which responses are admitted into the cache.
///
/// Both lists are part of the external configuration and are fixed for the lifetime of the
/// cache (see [crate::cache] for the config format).
#[derive(Clone, Debug)]
pub struct CachePolicy {
    cacheable_statuses: HashSet<u16>,
    cacheable_types: HashSet<String>,
}

impl CachePolicy {
    /// Creates a policy from the given allow-lists.
    pub fn new(
        cacheable_statuses: HashSet<u16>,
        cacheable_types: HashSet<String>,
    ) -> Self {
        CachePolicy {
            cacheable_statuses,
            cacheable_types,
        }
    }

    /// Determines if the given response carries an allow-listed status code and content type.
    ///
    /// # Examples
    /// ```
    /// # use mercury::response::{CachePolicy, Response};
    /// # use bytes::Bytes;
    /// # use std::collections::HashSet;
    /// let policy = CachePolicy::new(
    ///     vec![200].into_iter().collect(),
    ///     vec!["text/html".to_owned()].into_iter().collect(),
    /// );
    ///
    /// let html = Response::new(
    ///     200,
    ///     "OK",
    ///     vec![("content-type".to_owned(), "text/html; charset=utf-8".to_owned())],
    ///     Bytes::new(),
    /// );
    /// assert_eq!(policy.admits(&html), true);
    ///
    /// let missing = Response::new(404, "Not Found", vec![], Bytes::new());
    /// assert_eq!(policy.admits(&missing), false);
    /// ```
    pub fn admits(&self, response: &Response) -> bool {
        if !self.cacheable_statuses.contains(&response.status()) {
            return false;
        }

        response
            .content_type()
            .map(|content_type| self.cacheable_types.contains(content_type))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::response::{CachePolicy, Response};
    use bytes::Bytes;

    fn example_response() -> Response {
        Response::new(
            200,
            "OK",
            vec![
                ("Content-Type".to_owned(), "text/html; charset=utf-8".to_owned()),
                ("Set-Cookie".to_owned(), "a=1".to_owned()),
                ("Set-Cookie".to_owned(), "b=2".to_owned()),
            ],
            Bytes::from_static(b"<html>Hello</html>"),
        )
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = example_response();

        assert_eq!(
            response.header("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(response.header("CONTENT-TYPE").is_some(), true);
        assert_eq!(response.header("x-unknown").is_none(), true);

        // Duplicate fields yield their first value...
        assert_eq!(response.header("set-cookie").unwrap(), "a=1");
    }

    #[test]
    fn content_type_strips_parameters() {
        let response = example_response();
        assert_eq!(response.content_type().unwrap(), "text/html");

        // A response without a content-type has no media type at all...
        let empty = Response::new(204, "No Content", vec![], Bytes::new());
        assert_eq!(empty.content_type().is_none(), true);
    }

    #[test]
    fn policy_checks_status_and_type() {
        let policy = CachePolicy::new(
            vec![200, 301].into_iter().collect(),
            vec!["text/html".to_owned(), "image/png".to_owned()]
                .into_iter()
                .collect(),
        );

        assert_eq!(policy.admits(&example_response()), true);

        // Wrong status...
        let error = Response::new(
            500,
            "Internal Server Error",
            vec![("content-type".to_owned(), "text/html".to_owned())],
            Bytes::new(),
        );
        assert_eq!(policy.admits(&error), false);

        // Wrong content type...
        let json = Response::new(
            200,
            "OK",
            vec![("content-type".to_owned(), "application/json".to_owned())],
            Bytes::new(),
        );
        assert_eq!(policy.admits(&json), false);

        // Missing content type...
        let untyped = Response::new(200, "OK", vec![], Bytes::new());
        assert_eq!(policy.admits(&untyped), false);
    }

    #[test]
    fn wire_format_contains_status_line_headers_and_body() {
        let response = example_response();
        let wire = response.to_wire();
        let text = std::str::from_utf8(&wire).unwrap();

        assert_eq!(text.starts_with("HTTP/1.1 200 OK\r\n"), true);
        assert_eq!(text.contains("Content-Type: text/html; charset=utf-8\r\n"), true);
        assert_eq!(text.contains("Set-Cookie: a=1\r\n"), true);
        assert_eq!(text.contains("Set-Cookie: b=2\r\n"), true);
        assert_eq!(text.ends_with("\r\n\r\n<html>Hello</html>"), true);
    }
}
