//! Launch sequence (spec.md §4.G steps 1-13) and the bounded worker pool
//! that runs it.
//!
//! REDESIGN FLAGS: the original spawns one detached OS thread per accepted
//! webhook (`threading.Thread(target=create).start()`
//! in `original_source/src/server.py`). This crate instead runs a fixed
//! number of `tokio::spawn`ed workers reading off one `mpsc` channel, sized
//! by `Settings.launch_concurrency`, so a burst of pushes cannot exhaust
//! file descriptors or database connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterDriver;
use crate::config::Settings;
use crate::credentials::CredentialBroker;
use crate::error::{Error, Result};
use crate::forge::ForgeClient;
use crate::idp::{self, IdpClient};
use crate::image::ImageBuilder;
use crate::model::RunId;

/// The structured error sum type spec.md §9 calls for in place of the
/// original's broad `except Exception`. The domain variants it names
/// (`ResolveFailed`, `ProvisionFailed`) already exist on the crate-wide
/// error type, so the launch pipeline reuses it rather than duplicating
/// the same shape under a new name.
pub type LaunchError = Error;

/// One accepted push, queued for asynchronous launch.
#[derive(Debug, Clone)]
pub struct LaunchJob {
    pub gitlab_user_id: i64,
    pub source_url: String,
}

pub struct Components {
    pub forge: ForgeClient,
    pub idp: IdpClient,
    pub credentials: CredentialBroker,
    pub image: ImageBuilder,
    pub cluster: ClusterDriver,
    pub settings: Settings,
}

/// Start `concurrency` worker tasks draining one shared channel, and
/// return the sender side admission enqueues jobs onto.
pub fn spawn_worker_pool(components: Arc<Components>, concurrency: usize) -> mpsc::Sender<LaunchJob> {
    let (tx, rx) = mpsc::channel(1024);
    let rx = Arc::new(Mutex::new(rx));

    for worker in 0..concurrency {
        let components = components.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let job = rx.lock().await.recv().await;
                match job {
                    Some(job) => run_and_log(&components, job, worker).await,
                    None => break,
                }
            }
        });
    }

    tx
}

async fn run_and_log(components: &Components, job: LaunchJob, worker: usize) {
    match run_launch(components, &job).await {
        Ok(run_id) => info!(worker, %run_id, "launch succeeded"),
        Err(e) => error!(worker, source_url = %job.source_url, "launch failed: {e}"),
    }
}

/// Run the launch sequence for one job end to end. Any failure at steps
/// 1-12 triggers [`compensate`] before being returned (spec.md §9: replace
/// "partial resources may leak" with a compensating cleanup).
#[instrument(skip(components, job), fields(source_url = %job.source_url))]
async fn run_launch(components: &Components, job: &LaunchJob) -> Result<RunId> {
    let run_id = RunId::generate();
    match run_launch_inner(components, job, &run_id).await {
        Ok(()) => Ok(run_id),
        Err(e) => {
            compensate(&components.cluster, &run_id).await;
            Err(e)
        }
    }
}

async fn run_launch_inner(components: &Components, job: &LaunchJob, run_id: &RunId) -> Result<()> {
    // 1. Resolve the pushing identity across the IdP.
    let external_subject = components
        .forge
        .get_idp_user_id(job.gitlab_user_id)
        .await?
        .ok_or_else(|| {
            Error::ResolveFailed(format!(
                "gitlab user {} has no mapped external identity",
                job.gitlab_user_id
            ))
        })?;

    // 2. Resolve group membership, filter to mysql_ roles.
    let groups = components
        .idp
        .get_user_groups(&external_subject)
        .await?
        .ok_or_else(|| {
            Error::ResolveFailed(format!(
                "external subject {external_subject} has no group membership"
            ))
        })?;
    let roles = idp::mysql_roles(&groups);

    // 3. Issue an ephemeral DB principal scoped to those roles.
    let db_principal = components.credentials.create_db_principal(&roles).await?;

    // 5. Clone the source tree into its run-scoped working directory.
    let repo_workdir = components.settings.run_workdir(run_id)?;
    let forge = components.forge.clone();
    let clone_url = job.source_url.clone();
    let clone_dest = repo_workdir.clone();
    tokio::task::spawn_blocking(move || forge.clone(&clone_url, &clone_dest))
        .await
        .map_err(|e| Error::ProvisionFailed(format!("clone task panicked: {e}")))??;

    // 6. Create the output subdirectory on the host ahead of pod launch.
    let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let output_dir_name = format!("{timestamp}-{run_id}");
    let output_subdir = format!("{repo_workdir}/outputs/{output_dir_name}");
    std::fs::create_dir_all(&output_subdir)?;

    // 7. Parse run metadata, defaulting where absent.
    let meta = crate::metadata::parse_file(&repo_workdir)?;

    // 8. Build and publish the image.
    let image_ref = format!(
        "{}/{}/{}",
        components.settings.registry.url, components.settings.registry.project, run_id
    );
    components.image.build(&repo_workdir, &image_ref).await?;
    components.image.push_and_cleanup(&image_ref).await?;

    // 9. Commission the namespace. The deadline is derived here, immediately
    // before creation, so `rununtil` reflects the build duration rather than
    // drifting below `created_at + runfor` by however long steps 5-8 took.
    let deadline = Utc::now() + ChronoDuration::seconds((meta.runfor_hours * 3600.0) as i64);
    components
        .cluster
        .create_namespace(run_id, &external_subject, deadline)
        .await?;

    // 10-11. Output volume, and optional per-user cache volume. The output
    // PV's NFS path is rooted at the cluster-exported `k8s.pvcPath`, not the
    // local `repoPath` working directory the controller itself writes to.
    let nfs_output_path = format!(
        "{}/repos/{run_id}/outputs/{output_dir_name}",
        components.settings.k8s.pvc_path.trim_end_matches('/')
    );
    let cache_host_dir = match &meta.cache_dir {
        Some(dir) => {
            let host_dir = format!(
                "{}/{external_subject}/{dir}",
                components
                    .settings
                    .cache_path()
                    .ok_or_else(|| Error::ConfigError("path.cachePath not configured".to_string()))?
            );
            std::fs::create_dir_all(&host_dir)?;
            Some(host_dir)
        }
        None => None,
    };
    components
        .cluster
        .create_volumes(run_id, &nfs_output_path, cache_host_dir.as_deref())
        .await?;

    // 12. Commission the pod.
    let mut envs = BTreeMap::new();
    envs.insert("DB_USER".to_string(), db_principal.user.clone());
    envs.insert("DB_PASS".to_string(), db_principal.password.clone());
    envs.insert("DB_HOST".to_string(), components.settings.db.host.clone());
    envs.insert("OUTPUT_PATH".to_string(), "/output".to_string());
    envs.insert("SECD".to_string(), "PRODUCTION".to_string());

    components
        .cluster
        .create_pod(run_id, &image_ref, &envs, meta.gpu, meta.effective_mount_path())
        .await?;

    // 13. Log success.
    info!(%run_id, %external_subject, "launched run");
    Ok(())
}

/// On launch failure, remove whatever cluster resources were already
/// created for `run_id` rather than leaving the deadline reaper as the
/// only backstop.
async fn compensate(cluster: &ClusterDriver, run_id: &RunId) {
    if let Err(e) = cluster.delete_namespace_if_exists(run_id).await {
        warn!(%run_id, "compensating cleanup failed to remove namespace: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_job_carries_identity_and_source() {
        let job = LaunchJob {
            gitlab_user_id: 42,
            source_url: "https://gitlab.example.com/a/b.git".to_string(),
        };
        assert_eq!(job.gitlab_user_id, 42);
    }
}
