//! Reaper Daemon (component H): periodic scan of cluster state, one thread
//! for the whole process lifetime.
//!
//! Grounded in `original_source/src/daemon.py` (`while True: ...;
//! time.sleep(60)`) and run as a `tokio::spawn`ed task the way the teacher
//! runs `CarbonAwareScheduler::start_refresh_loop` with
//! `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument};

use crate::cluster::ClusterDriver;
use crate::config::Settings;
use crate::forge::ForgeClient;

/// Start the reaper loop as a detached task. Returns its `JoinHandle` so
/// `main` can hold it for the lifetime of the process.
pub fn spawn(forge: Arc<ForgeClient>, cluster: Arc<ClusterDriver>, settings: Arc<Settings>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(settings.reaper_interval_secs));
        loop {
            interval.tick().await;
            tick(&forge, &cluster, &settings).await;
        }
    })
}

/// One reaper iteration (spec.md §4.H): terminate every namespace that's
/// expired or whose pod succeeded, then publish results for each one.
/// Within an iteration, termination of a run's cluster resources always
/// completes before its result publication begins (spec.md §4.H ordering
/// guarantee); runs are processed sequentially, not concurrently.
#[instrument(skip(forge, cluster, settings))]
async fn tick(forge: &ForgeClient, cluster: &ClusterDriver, settings: &Settings) {
    let terminated = match cluster.list_terminal().await {
        Ok(run_ids) => run_ids,
        Err(e) => {
            error!("failed to list terminal namespaces: {e}");
            return;
        }
    };

    for run_id in terminated {
        info!(%run_id, "reaping run");
        let repo_workdir = match settings.run_workdir(&run_id) {
            Ok(path) => path,
            Err(e) => {
                error!(%run_id, "could not derive working directory: {e}");
                continue;
            }
        };
        let forge = forge.clone();
        let run_id_for_blocking = run_id.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            forge.push_results(&repo_workdir, &run_id_for_blocking)
        })
        .await
        {
            error!(%run_id, "push_results task panicked: {e}");
        }
        info!(%run_id, "finished reaping run");
    }
}
