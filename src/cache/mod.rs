//! Provides the size constrained response cache of the proxy.
//!
//! Response headers are stored separately from response bodies, as different URIs can (and
//! regularly do) yield the same response body. Bodies are addressed by a digest of their
//! bytes and reference counted, so each distinct body is kept in memory exactly once. See
//! [store](store) for the body side and [index](index) for the header side.
//!
//! Due to the tight memory budget the following strategy is used: if the cache overflows, the
//! oldest cached entry is removed. This only requires keeping a history of the cached URIs
//! (see [queue](queue)) instead of sorting or re-ordering cache content on every access.
//! There is no point in revalidating entries via If-Modified-Since or ETag requests either -
//! a few minutes of intensive surfing will cycle the whole cache anyway.
//!
//! To use this facility, [install](install) has to be invoked. The configuration is fetched
//! once from the system config at startup:
//!
//! # Configuration
//! ```yaml
//! cache:
//!     # Specifies the maximal amount of memory to use (in bytes).
//!     # Supports common suffixes like: k, m, g, t
//!     max_memory: 64m
//!     # Specifies the status codes of cacheable responses.
//!     cacheable_statuses: [200]
//!     # Specifies the media types of cacheable responses.
//!     cacheable_types:
//!         - text/html
//!         - text/css
//!         - text/plain
//!         - application/javascript
//!         - image/png
//!         - image/jpeg
//!         - image/gif
//!     # If enabled, every insertion and eviction emits a diagnostic log message.
//!     debug: false
//! ```
//!
//! Note that in contrast to the rest of the system, the cache does not re-process config
//! changes: re-shaping a populated cache would invalidate its size accounting, therefore its
//! settings remain fixed until restart.
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use yaml_rust::Yaml;

use crate::config::Config;
use crate::fmt::{format_size, parse_size};
use crate::platform::Platform;
use crate::response::CachePolicy;

pub mod accounting;
pub mod index;
pub mod queue;
pub mod response_cache;
pub mod store;

pub use response_cache::ResponseCache;
pub use response_cache::Stats;

/// The default memory budget if the config does not specify one.
const DEFAULT_MAX_MEMORY: usize = 64 * 1024 * 1024;

/// Enumerates the error conditions reported by the cache.
#[derive(Debug)]
pub enum CacheError {
    /// A lookup was performed for a URI which is not cached.
    ///
    /// This is an entirely expected condition - the caller simply fetches the response from
    /// the origin server.
    NotFound,

    /// An entry was too large to ever fit into the cache, even with everything else evicted.
    ///
    /// The caller should serve the response uncached.
    EntryTooLarge,

    /// The internal bookkeeping of the cache is inconsistent (e.g. a header references a
    /// missing body).
    ///
    /// This always indicates a defect. The offending entry is skipped, all other cache
    /// operations keep working.
    InvariantViolation(String),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "The requested URI is not cached."),
            CacheError::EntryTooLarge => {
                write!(f, "The entry to be cached is larger than the whole cache!")
            }
            CacheError::InvariantViolation(message) => {
                write!(f, "Cache invariant violated: {}", message)
            }
        }
    }
}

impl Error for CacheError {}

/// Creates and installs a [ResponseCache] into the given platform.
///
/// The cache settings are read from the **cache** object of the system config (see the module
/// docs for the format). Missing or invalid settings fall back to their defaults with an
/// error being logged, so a broken config yields a working (if conservatively configured)
/// proxy rather than none at all.
pub fn install(platform: Arc<Platform>) {
    let config = platform.require::<Config>();
    let handle = config.current();
    let settings = &handle.yaml()["cache"];

    let budget = parse_max_memory(settings);
    let policy = CachePolicy::new(
        parse_cacheable_statuses(settings),
        parse_cacheable_types(settings),
    );
    let verbose = settings["debug"].as_bool().unwrap_or(false);

    log::info!(
        "Creating response cache with a budget of {}...",
        format_size(budget)
    );

    platform.register::<ResponseCache>(Arc::new(ResponseCache::new(budget, policy, verbose)));
}

/// Reads the memory budget from the config, falling back to 64 MiB.
fn parse_max_memory(settings: &Yaml) -> usize {
    match &settings["max_memory"] {
        Yaml::BadValue => DEFAULT_MAX_MEMORY,
        value => {
            let raw = value
                .as_str()
                .map(|string| string.to_owned())
                .or_else(|| value.as_i64().map(|number| number.to_string()))
                .unwrap_or_default();
            match parse_size(&raw) {
                Ok(budget) => budget,
                Err(error) => {
                    log::error!(
                        "Failed to parse 'cache.max_memory': {} Using the default of {}.",
                        error,
                        format_size(DEFAULT_MAX_MEMORY)
                    );
                    DEFAULT_MAX_MEMORY
                }
            }
        }
    }
}

/// Reads the allow-listed status codes from the config, falling back to 200 only.
fn parse_cacheable_statuses(settings: &Yaml) -> HashSet<u16> {
    let statuses = match settings["cacheable_statuses"].as_vec() {
        Some(list) => list
            .iter()
            .filter_map(|entry| {
                entry
                    .as_i64()
                    .or_else(|| entry.as_str().and_then(|code| code.parse().ok()))
            })
            .filter(|code| *code > 0 && *code < 1000)
            .map(|code| code as u16)
            .collect::<HashSet<_>>(),
        None => HashSet::new(),
    };

    if statuses.is_empty() {
        HashSet::from([200])
    } else {
        statuses
    }
}

/// Reads the allow-listed media types from the config, falling back to common web content.
fn parse_cacheable_types(settings: &Yaml) -> HashSet<String> {
    let types = match settings["cacheable_types"].as_vec() {
        Some(list) => list
            .iter()
            .filter_map(|entry| entry.as_str())
            .map(|media_type| media_type.trim().to_owned())
            .collect::<HashSet<_>>(),
        None => HashSet::new(),
    };

    if types.is_empty() {
        [
            "text/html",
            "text/css",
            "text/plain",
            "application/javascript",
            "image/png",
            "image/jpeg",
            "image/gif",
        ]
        .iter()
        .map(|media_type| (*media_type).to_owned())
        .collect()
    } else {
        types
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{parse_cacheable_statuses, parse_cacheable_types, parse_max_memory};
    use crate::cache::{install, ResponseCache};
    use crate::config::Config;
    use crate::platform::Platform;
    use std::sync::Arc;
    use yaml_rust::YamlLoader;

    fn settings(yaml: &str) -> yaml_rust::Yaml {
        YamlLoader::load_from_str(yaml)
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn max_memory_is_parsed_with_suffixes() {
        assert_eq!(
            parse_max_memory(&settings("max_memory: 8m")),
            8 * 1024 * 1024
        );
        assert_eq!(parse_max_memory(&settings("max_memory: 1024")), 1024);

        // Missing or broken settings fall back to the default...
        assert_eq!(
            parse_max_memory(&settings("other: true")),
            super::DEFAULT_MAX_MEMORY
        );
        assert_eq!(
            parse_max_memory(&settings("max_memory: lots")),
            super::DEFAULT_MAX_MEMORY
        );
    }

    #[test]
    fn status_and_type_lists_are_parsed() {
        let settings = settings(
            "cacheable_statuses: [200, '301']\ncacheable_types:\n  - text/html\n  - image/png",
        );

        let statuses = parse_cacheable_statuses(&settings);
        assert_eq!(statuses.contains(&200), true);
        assert_eq!(statuses.contains(&301), true);
        assert_eq!(statuses.len(), 2);

        let types = parse_cacheable_types(&settings);
        assert_eq!(types.contains("text/html"), true);
        assert_eq!(types.contains("image/png"), true);
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn empty_lists_fall_back_to_defaults() {
        let settings = settings("other: 42");

        assert_eq!(parse_cacheable_statuses(&settings), [200].into());
        assert_eq!(parse_cacheable_types(&settings).contains("text/html"), true);
    }

    #[test]
    fn install_registers_a_configured_cache() {
        crate::testing::test_async(async {
            let platform = Platform::new();
            let config = Arc::new(Config::new("settings.yml"));
            config
                .load_from_string(
                    "
cache:
    max_memory: 2m
    cacheable_statuses: [200]
    cacheable_types:
        - text/html
",
                    None,
                )
                .unwrap();
            platform.register::<Config>(config);

            install(platform.clone());

            let cache = platform.require::<ResponseCache>();
            assert_eq!(cache.budget(), 2 * 1024 * 1024);
            assert_eq!(cache.is_empty(), true);
        });
    }
}
