//! Mercury is a forwarding HTTP proxy built around a size-constrained, content-addressed
//! response cache.
//!
//! # Introduction
//! **Mercury** accepts plain HTTP requests, forwards them to the origin server and remembers
//! the responses it has seen. A subsequent request for the same URI is answered straight from
//! memory without touching the network again.
//!
//! The interesting part is not the forwarding (which is thin plumbing around
//! [hyper](https://hyper.rs/)) but the cache itself: response headers and response bodies are
//! stored separately, as distinct URIs frequently yield the exact same body bytes (error pages,
//! redirects, shared assets). Bodies are therefore stored once, addressed by a digest of their
//! contents and shared between all cached headers via reference counting. The whole cache is
//! kept within a configurable memory budget by evicting the oldest entries first.
//!
//! # Features
//! * **Content-addressed body store** - equal response bodies are stored exactly once, no
//!   matter how many URIs produce them. See [cache::store].
//! * **Deterministic size accounting** - the memory footprint of each entry is estimated by an
//!   explicit, reproducible calculation rather than by asking the allocator. This keeps the
//!   bookkeeping exact enough that evictions always credit precisely what insertions charged.
//!   See [cache::accounting].
//! * **FIFO eviction** - when the budget is exceeded, the oldest cached entry is dropped. No
//!   access-time tracking, no sorting, just a queue of insertions. See [cache::queue].
//! * **100% Async/Await plumbing** - the server and upstream client build upon
//!   [tokio](https://tokio.rs/) and hyper, while the cache core is a plain synchronous
//!   structure guarded by a single lock.
//! * **Reload-aware config facility** - the server picks up changes to **config/settings.yml**
//!   during operation, just like the rest of our tooling. The cache settings themselves are
//!   fixed at startup.
//!
//! # Modules
//! * **Cache**: the response cache core - header index, content store, eviction queue and the
//!   orchestrator tying them together: [crate::cache]
//! * **Server**: the accept loop and per-connection handling: [crate::server]
//! * **Upstream**: the hyper based client used to fetch from origin servers: [crate::upstream]
//!
//! # Using Mercury
//! **Mercury** is intended to be embedded via the [Builder](builder::Builder):
//! ```no_run
//! # use mercury::builder::Builder;
//! # use mercury::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!     mercury::cache::install(platform.clone());
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod platform;
pub mod request;
pub mod response;
pub mod server;
pub mod signals;
pub mod upstream;

/// Contains the version of the Mercury library.
pub const MERCURY_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Mercury build being used.
pub const MERCURY_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate mercury;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is mainly our test port (1605) on which we start a local proxy
        /// along with its upstream counterpart (1606) for integration tests. Using this
        /// lock, we can still execute all other tests in parallel and only block if
        /// required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
