//! Provides the parser for incoming proxy requests.
//!
//! A browser which is configured to use a forwarding proxy sends its request line in
//! absolute-form (`GET http://example.com/path HTTP/1.1`). Plain clients use origin-form
//! (`GET /path HTTP/1.1`) along with a **Host** field. Both shapes are normalized here into a
//! [Request] carrying the absolute request URI, which is also the key under which responses
//! are cached.
//!
//! Note that [Request::parse](Request::parse) operates on a growing receive buffer: it returns
//! **Ok(None)** as long as the header block is still incomplete so that the
//! [server](crate::server) simply keeps on reading.

/// Represents a parsed HTTP request as received from a proxy client.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Tries to parse a request from the given receive buffer.
    ///
    /// Returns **Ok(None)** if the buffer does not yet contain the complete header block
    /// (terminated by an empty line). Fails if the data present is not a valid HTTP/1.x
    /// request.
    ///
    /// # Examples
    /// ```
    /// # use mercury::request::Request;
    /// // An incomplete request yields None so that the caller keeps reading...
    /// assert_eq!(Request::parse(b"GET http://exam").unwrap().is_none(), true);
    ///
    /// // ...a complete one is parsed into its parts.
    /// let request = Request::parse(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(request.method(), "GET");
    /// assert_eq!(request.uri(), "http://example.com/");
    /// ```
    pub fn parse(data: &[u8]) -> anyhow::Result<Option<Request>> {
        let header_block = match complete_header_block(data) {
            Some(block) => block,
            None => return Ok(None),
        };

        let text = std::str::from_utf8(header_block)
            .map_err(|_| anyhow::anyhow!("Received a request which isn't valid UTF-8."))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split(' ');
        let method = parts
            .next()
            .filter(|method| !method.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Received an empty request line."))?;
        let target = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Request line lacks a request target."))?;
        let version = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Request line lacks a protocol version."))?;

        if !version.starts_with("HTTP/") {
            return Err(anyhow::anyhow!(
                "Received a non-HTTP request line: {}",
                request_line
            ));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_owned(), value.trim().to_owned()))
                }
                None => {
                    return Err(anyhow::anyhow!("Received a malformed header field: {}", line))
                }
            }
        }

        let uri = resolve_uri(target, &headers)?;

        Ok(Some(Request {
            method: method.to_owned(),
            uri,
            headers,
        }))
    }

    /// Returns the HTTP method (verb) of this request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the absolute request URI.
    ///
    /// This is also the key under which a response for this request is cached.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the first value of the given header field (compared case-insensitively).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Extracts the header block (everything before the empty line) if it is already complete.
fn complete_header_block(data: &[u8]) -> Option<&[u8]> {
    data.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|end| &data[..end])
}

/// Normalizes the request target into an absolute URI.
///
/// Absolute-form targets are taken as is, origin-form targets are combined with the **Host**
/// field.
fn resolve_uri(target: &str, headers: &[(String, String)]) -> anyhow::Result<String> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(target.to_owned());
    }

    let host = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| {
            anyhow::anyhow!("Cannot resolve the request URI: neither an absolute request target nor a Host field is present.")
        })?;

    Ok(format!("http://{}{}", host, target))
}

#[cfg(test)]
mod tests {
    use crate::request::Request;

    #[test]
    fn absolute_form_requests_are_parsed() {
        let request =
            Request::parse(b"GET http://example.com/index.html HTTP/1.1\r\nAccept: */*\r\n\r\n")
                .unwrap()
                .unwrap();

        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), "http://example.com/index.html");
        assert_eq!(request.header("accept").unwrap(), "*/*");
    }

    #[test]
    fn origin_form_requests_use_the_host_field() {
        let request = Request::parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(request.uri(), "http://example.com/index.html");
    }

    #[test]
    fn partial_requests_yield_none() {
        assert_eq!(Request::parse(b"").unwrap().is_none(), true);
        assert_eq!(Request::parse(b"GET / HTTP/1.1\r\n").unwrap().is_none(), true);
        assert_eq!(
            Request::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n")
                .unwrap()
                .is_none(),
            true
        );
    }

    #[test]
    fn malformed_requests_are_rejected() {
        // Not HTTP at all...
        assert_eq!(Request::parse(b"HELLO WORLD FOO\r\n\r\n").is_err(), true);

        // Missing protocol version...
        assert_eq!(Request::parse(b"GET /\r\n\r\n").is_err(), true);

        // Origin-form without a Host field...
        assert_eq!(Request::parse(b"GET / HTTP/1.1\r\n\r\n").is_err(), true);

        // Broken header field...
        assert_eq!(
            Request::parse(b"GET http://example.com/ HTTP/1.1\r\nNoColonHere\r\n\r\n").is_err(),
            true
        );
    }

    #[test]
    fn non_get_methods_are_parsed_but_reported_as_such() {
        let request = Request::parse(b"POST http://example.com/form HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), "POST");
    }
}
