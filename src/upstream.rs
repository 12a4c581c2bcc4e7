//! Provides the client used to fetch responses from origin servers.
//!
//! This is thin plumbing around a [hyper](https://hyper.rs/) client: fetch the requested URI,
//! follow a bounded number of redirects and convert the result into our own
//! [Response](crate::response::Response) representation. Hop-by-hop header fields are dropped
//! during the conversion and the content length is re-derived from the collected body, as we
//! always deliver responses un-chunked to our clients.
//!
//! Note that we only talk plain HTTP to origin servers, just like our clients only talk plain
//! HTTP to us.
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::HeaderName;
use hyper::{Body, Client, Uri};
use std::sync::Arc;

use crate::platform::Platform;
use crate::response::Response;

/// Limits how many redirects are followed before a fetch is aborted.
const MAX_REDIRECTS: usize = 10;

/// Fetches responses from origin servers on behalf of the proxy.
pub struct UpstreamClient {
    client: Client<HttpConnector, Body>,
}

impl UpstreamClient {
    /// Creates and installs an **UpstreamClient** into the given platform.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let client = Arc::new(UpstreamClient {
            client: Client::new(),
        });

        platform.register::<UpstreamClient>(client.clone());

        client
    }

    /// Fetches the given URI from its origin server.
    ///
    /// Redirects are followed transparently (up to a limit of 10), so the returned response
    /// is always the final one.
    pub async fn fetch(&self, uri: &str) -> anyhow::Result<Response> {
        let mut target = uri
            .parse::<Uri>()
            .map_err(|error| anyhow::anyhow!("Cannot parse the URI {}: {}", uri, error))?;

        for _ in 0..MAX_REDIRECTS {
            let result = self.client.get(target.clone()).await?;

            if result.status().is_redirection() {
                let location = result
                    .headers()
                    .get(hyper::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        anyhow::anyhow!("{} redirected without a location field.", target)
                    })?;
                log::debug!("{} redirected to {}...", target, location);
                target = resolve_location(&target, location)?;
                continue;
            }

            return convert(result).await;
        }

        Err(anyhow::anyhow!(
            "Giving up on {} after {} redirects.",
            uri,
            MAX_REDIRECTS
        ))
    }
}

/// Resolves a location field against the URI which yielded the redirect.
fn resolve_location(current: &Uri, location: &str) -> anyhow::Result<Uri> {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_owned()
    } else {
        // A path-only location keeps scheme and authority of the redirecting URI...
        format!(
            "{}://{}{}",
            current.scheme_str().unwrap_or("http"),
            current
                .authority()
                .map(|authority| authority.as_str())
                .unwrap_or_default(),
            location
        )
    };

    absolute
        .parse::<Uri>()
        .map_err(|error| anyhow::anyhow!("Cannot parse the redirect target {}: {}", absolute, error))
}

/// Converts a hyper response into our own representation.
///
/// This collects the whole body into memory - which is fine, as everything we serve has to be
/// small enough to be a caching candidate anyway.
async fn convert(result: hyper::Response<Body>) -> anyhow::Result<Response> {
    let (parts, body) = result.into_parts();
    let body: Bytes = hyper::body::to_bytes(body).await?;

    let mut headers = Vec::new();
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || name == &hyper::header::CONTENT_LENGTH {
            continue;
        }
        headers.push((
            name.as_str().to_owned(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        ));
    }
    // The body is delivered as one un-chunked block, so its length is authoritative...
    headers.push(("content-length".to_owned(), body.len().to_string()));

    Ok(Response::new(
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or(""),
        headers,
        body,
    ))
}

/// Determines if the given field is hop-by-hop and therefore must not be forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use crate::upstream::{is_hop_by_hop, resolve_location};
    use hyper::Uri;

    #[test]
    fn locations_are_resolved_against_the_current_uri() {
        let current = "http://example.com/some/page".parse::<Uri>().unwrap();

        assert_eq!(
            resolve_location(&current, "http://other.example.com/")
                .unwrap()
                .to_string(),
            "http://other.example.com/"
        );
        assert_eq!(
            resolve_location(&current, "/moved/here").unwrap().to_string(),
            "http://example.com/moved/here"
        );
    }

    #[test]
    fn hop_by_hop_fields_are_recognized() {
        assert_eq!(is_hop_by_hop(&hyper::header::CONNECTION), true);
        assert_eq!(is_hop_by_hop(&hyper::header::TRANSFER_ENCODING), true);
        assert_eq!(is_hop_by_hop(&hyper::header::CONTENT_TYPE), false);
    }
}
