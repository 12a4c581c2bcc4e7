//! Contains the server component of Mercury.
//!
//! Opens a server-socket on the specified port (**server.port** in the config or 2600 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each incoming client is expected to send a plain HTTP request which is either
//! answered from the [cache](crate::cache) or forwarded to the origin server via the
//! [upstream](crate::upstream) client.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port, therefore a "new" instance
//! can be started and the "old" one can bleed out and the port will be "handed through" with
//! minimal downtime. Also, this will listen to change events of the config and will relocate
//! to another port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! use mercury::builder::Builder;
//! use mercury::config::Config;
//! use mercury::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     //  Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1605
//!     ", None);
//!
//!     // Setup and enable the response cache...
//!     mercury::cache::install(platform.clone());
//!
//!     // Run the platform...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use crate::spawn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cache::{CacheError, ResponseCache};
use crate::config::Config;
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::request::Request;
use crate::upstream::UpstreamClient;
use std::sync::Mutex;
use tokio::net::tcp::WriteHalf;

/// Specifies the timeout when waiting for incoming data on a client connection.
///
/// When waiting for incoming data we need to interrupt this every once in a while to check
/// if the platform is being shut down.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Determines the pre-allocated receive buffer size for incoming requests. Most requests will
/// / should fit into this buffer so that no additional allocations are required when handling
/// a request.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Represents a server which accepts and dispatches all client connections.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done
    /// manually via [event_loop](Server::event_loop) as it is most probably done in the main
    /// thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of
    /// the server. Rather we toggle this flag to false if a config and therefore address
    /// change was detected. This way **server_loop** will exit and a new server socket for
    /// the appropriate address will be setup by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2600 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.yaml()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
                    handle.yaml()["server"]["port"]
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(2600)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:2600".to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and
    /// running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming client
    /// connections.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, we enter the **server_loop** to actually handle incoming connections.
    /// Once this loop returns, either the platform is no longer running and we should exit,
    /// or the config has changed and we should try to bind the server to the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due to
            // a config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened server socket on {}...", &address);
                *self.current_address.lock().unwrap() = Some(address.clone());
                self.server_loop(&listener).await;
                log::info!("Closing server socket on {}.", &address);
            } else {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open server address: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (server
    /// address changed...).
    async fn server_loop(&self, listener: &TcpListener) {
        let mut config_changed_flag = self.platform.require::<Config>().notifier();

        while self.platform.is_running() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp. platform.is_running())
                // is checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply indicates
                    // that the timeout was hit - in this case we do nothing as the while condition
                    // is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        // If a stream is present, we treat this as new connection and eventually
                        // start a client loop for it...
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // Otherwise the socket has been closed therefore we exit to the
                            // event_loop which will either completely exit or try to re-create
                            // the socket.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // If the config was changed, we need to check if the address itself changed...
                    let new_address = self.address();
                    if let Some(current_address) = &*self.current_address.lock().unwrap() {
                       if current_address != &new_address {
                           log::info!("Server address has changed. Restarting server socket...");

                           // Force the event_loop to re-evaluate the expected server address...
                           self.running.store(false, Ordering::Release);

                           // Return to event_loop so that the server socket is re-created...
                           return;
                       }
                    }
               }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// This forks a "thread" which mainly simply executes the **proxy_protocol_loop** for
    /// this connection.
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as we already optimize all writes as far as
            // possible.
            let _ = stream.set_nodelay(true);

            let peer_address = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Opened connection from {}...", peer_address);

            // Executes the client loop for this connection....
            if let Err(error) = proxy_protocol_loop(platform, stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", peer_address);
        });
    }
}

/// Executed per client to process an incoming HTTP request.
///
/// Note that we answer exactly one request per connection and close it afterwards, which
/// relieves us of any keep-alive bookkeeping. Clients fall back to fresh connections
/// transparently.
async fn proxy_protocol_loop(
    platform: Arc<Platform>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    // Pre-allocate a buffer for the incoming request. This will only be re-allocated if a
    // request was larger than 8 KB...
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() {
        // We apply a timeout here, so that the condition of the while loop is checked every
        // once in a while...
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            // Best case, we read some bytes from the socket..
            Ok(Ok(bytes_read)) if bytes_read > 0 => match Request::parse(&input_buffer) {
                // aaand we were able to parse an HTTP request from the given data in the
                // buffer...
                Ok(Some(request)) => {
                    serve_request(&platform, &request, &mut writer).await?;

                    // Return from the loop to effectively close the connection...
                    return Ok(());
                }
                Err(error) => {
                    handle_protocol_error(error, &mut writer).await?;

                    // Return from the loop to effectively close the connection...
                    return Ok(());
                }
                // A partial request is present - do nothing so that we keep on reading...
                _ => (),
            },

            // Reading from the client returned a zero length result -> the client wants to
            // close the connection. We therefore return from this loop.
            Ok(Ok(0)) => return Ok(()),

            // An IO error occurred while reading - notify our caller and abort...
            Ok(Err(error)) => {
                return Err(anyhow::anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // The timeout elapsed before any data was read => do nothing, all we want to do
            // is to re-evaluate our while condition anyway...
            _ => (),
        }
    }

    Ok(())
}

/// Serves a single parsed request, either from the cache or from the origin server.
async fn serve_request(
    platform: &Arc<Platform>,
    request: &Request,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    if request.method() != "GET" {
        log::debug!(
            "Rejecting a {} request for {} - only GET is supported.",
            request.method(),
            request.uri()
        );
        writer
            .write_all(b"HTTP/1.1 501 Not Implemented\r\ncontent-length: 0\r\n\r\n")
            .await?;
        writer.flush().await?;
        return Ok(());
    }

    let cache = platform.require::<ResponseCache>();

    match cache.get(request.uri()) {
        Ok(response) => {
            log::debug!("Serving {} from cache...", request.uri());
            writer.write_all(&response.to_wire()).await?;
            writer.flush().await?;
            Ok(())
        }
        // Both a plain miss and a damaged entry (which has already been logged by the cache)
        // degrade to fetching from the origin server...
        Err(_) => serve_from_upstream(platform, request, writer).await,
    }
}

/// Fetches the requested URI from its origin server, caches the response if permitted and
/// serves it to the client.
async fn serve_from_upstream(
    platform: &Arc<Platform>,
    request: &Request,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    let upstream = platform.require::<UpstreamClient>();
    let cache = platform.require::<ResponseCache>();

    let watch = Instant::now();
    match upstream.fetch(request.uri()).await {
        Ok(response) => {
            log::debug!(
                "Fetched {} in {}.",
                request.uri(),
                format_short_duration(watch.elapsed().as_micros() as i32)
            );

            if cache.admits(&response) {
                match cache.add(request.uri(), &response) {
                    Ok(()) => (),
                    Err(CacheError::EntryTooLarge) => {
                        // Perfectly fine - the response is simply served uncached...
                        log::debug!("Not caching {} - the entry is too large.", request.uri());
                    }
                    Err(error) => {
                        log::error!("Failed to cache {}: {}", request.uri(), error);
                    }
                }
            }

            writer.write_all(&response.to_wire()).await?;
            writer.flush().await?;
            Ok(())
        }
        Err(error) => {
            log::error!("Failed to fetch {}: {}", request.uri(), error);
            writer
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
                .await?;
            writer.flush().await?;
            Ok(())
        }
    }
}

/// Answers a malformed request with a 400 before closing the connection.
async fn handle_protocol_error(
    error: anyhow::Error,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    log::debug!("Received a malformed request: {}", error);
    writer
        .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
        .await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cache::ResponseCache;
    use crate::config::Config;
    use crate::server::Server;
    use crate::spawn;
    use crate::testing::test_async;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Starts a tiny origin server on port 1606 which serves the same HTML page for every
    /// request.
    fn start_upstream() {
        use hyper::service::{make_service_fn, service_fn};

        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, std::convert::Infallible>(service_fn(|_req| async {
                Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(200)
                        .header("content-type", "text/html")
                        .body(hyper::Body::from("<html>Hello from upstream</html>"))
                        .unwrap(),
                )
            }))
        });

        let address = ([127, 0, 0, 1], 1606).into();
        spawn!(async move {
            let _ = hyper::Server::bind(&address).serve(make_svc).await;
        });
    }

    /// Sends a raw request to the proxy and collects the complete response (the proxy closes
    /// the connection once the response has been written).
    async fn query_proxy(request: &str) -> String {
        let mut stream = TcpStream::connect("127.0.0.1:1605").await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[test]
    fn integration_test() {
        // We want exclusive access to the ports 1605/1606 on which we fire up a test proxy
        // along with its origin counterpart...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            //  Setup and create a platform...
            let platform = Builder::new().enable_all().build().await;

            // Specify a minimal config so that we run on a different port than a
            // production instance.
            platform
                .require::<Config>()
                .load_from_string(
                    "
                server:
                    port: 1605
                cache:
                    max_memory: 4m
            ",
                    None,
                )
                .unwrap();

            // Setup and enable the response cache...
            crate::cache::install(platform.clone());

            // Fire up the origin server and the proxy itself...
            start_upstream();
            Server::fork_and_await(&platform.require::<Server>()).await;

            // The first request is fetched from the origin server...
            let response =
                query_proxy("GET http://127.0.0.1:1606/hello HTTP/1.1\r\n\r\n").await;
            assert_eq!(response.starts_with("HTTP/1.1 200 OK\r\n"), true);
            assert_eq!(response.contains("Hello from upstream"), true);

            // ...and is now cached.
            let cache = platform.require::<ResponseCache>();
            assert_eq!(cache.has("http://127.0.0.1:1606/hello"), true);

            // The second request is answered from the cache...
            let response =
                query_proxy("GET http://127.0.0.1:1606/hello HTTP/1.1\r\n\r\n").await;
            assert_eq!(response.contains("Hello from upstream"), true);
            assert_eq!(cache.stats().hits >= 1, true);

            // Anything but GET is answered with a 501...
            let response =
                query_proxy("POST http://127.0.0.1:1606/hello HTTP/1.1\r\n\r\n").await;
            assert_eq!(response.starts_with("HTTP/1.1 501"), true);

            // Garbage is answered with a 400...
            let response = query_proxy("NO HTTP HERE\r\n\r\n").await;
            assert_eq!(response.starts_with("HTTP/1.1 400"), true);

            platform.terminate();
        });
    }
}
