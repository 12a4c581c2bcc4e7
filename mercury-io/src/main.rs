use mercury::builder::Builder;
use mercury::server::Server;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;

    // Setup and enable the response cache...
    mercury::cache::install(platform.clone());

    platform.require::<Server>().event_loop().await;
}
