//! secd entry point.
//!
//! Loads configuration, wires up the component clients, starts the reaper
//! loop and the bounded launch worker pool, and serves the admission
//! endpoint until the process is killed.

use std::net::SocketAddr;
use std::sync::Arc;

use secd::admission::launch::{spawn_worker_pool, Components};
use secd::admission::{router, AppState};
use secd::cluster::ClusterDriver;
use secd::config::Settings;
use secd::credentials::CredentialBroker;
use secd::forge::ForgeClient;
use secd::idp::IdpClient;
use secd::image::ImageBuilder;
use secd::reaper;
use secd::{telemetry, Error};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    telemetry::init();

    info!("starting secd v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    settings.loaded_from_legacy_path();

    let forge = ForgeClient::new(&settings.gitlab);
    let idp = IdpClient::new(&settings.keycloak);
    let credentials = CredentialBroker::connect(&settings.db).await?;
    let image = ImageBuilder::connect(&settings.registry)?;
    let cluster = ClusterDriver::connect(&settings.k8s).await?;

    info!("connected to MySQL, Docker daemon and Kubernetes API");

    let launch_concurrency = settings.launch_concurrency;
    let components = Arc::new(Components {
        forge: forge.clone(),
        idp,
        credentials,
        image,
        cluster: cluster.clone(),
        settings,
    });

    let launch_tx = spawn_worker_pool(components.clone(), launch_concurrency);
    info!(launch_concurrency, "started launch worker pool");

    let reaper_handle = reaper::spawn(
        Arc::new(forge),
        Arc::new(cluster),
        Arc::new(components.settings.clone()),
    );
    info!("started reaper daemon");

    let state = AppState { components, launch_tx };
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("serving on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    reaper_handle.abort();
    Ok(())
}
