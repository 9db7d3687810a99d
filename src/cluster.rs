//! Cluster Driver (component E): the only part of the system that talks to
//! Kubernetes.
//!
//! Grounded in `original_source/src/k8s_service.py` for naming and resource
//! shape, and in the teacher's `controller/resources.rs` for the
//! `Api<T>`/`PostParams`/`ObjectMeta` builder style. spec.md §9 Open
//! Question 4 formalizes the "managed namespace" predicate as
//! [`is_managed`] and adds the `app.kubernetes.io/managed-by` label so
//! enumeration can use a label selector instead of scanning every
//! namespace in the cluster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Namespace, NFSVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod,
    PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Config};
use tracing::{info, warn};

use crate::config::K8sSettings;
use crate::error::{Error, Result};
use crate::model::{pv_name, pvc_name, RunId, VolumeKind};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "secd-controller";
const NAMESPACE_PREFIX: &str = "secd-";
const PV_CAPACITY: &str = "50Gi";
const NFS_SERVER: &str = "nfs.secd";

#[derive(Clone)]
pub struct ClusterDriver {
    client: Client,
}

impl ClusterDriver {
    pub async fn connect(settings: &K8sSettings) -> Result<Self> {
        let client = match &settings.config_path {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)
                    .map_err(|e| Error::ConfigError(format!("reading kubeconfig {path}: {e}")))?;
                let config = Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await
                .map_err(|e| Error::ConfigError(format!("building kube config: {e}")))?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self { client })
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvs(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    /// Create the namespace for a run, annotated with its owner and
    /// deadline (spec.md §4.E).
    pub async fn create_namespace(&self, run_id: &RunId, user_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert("userid".to_string(), user_id.to_string());
        annotations.insert("rununtil".to_string(), deadline.to_rfc3339());

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(crate::model::namespace_name(run_id)),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: None,
            status: None,
        };

        info!("creating namespace {}", run_id.as_str());
        self.namespaces()
            .create(&PostParams::default(), &namespace)
            .await?;
        Ok(())
    }

    /// Create the output PV/PVC, and the cache PV/PVC when `cache_host_dir`
    /// is set.
    pub async fn create_volumes(
        &self,
        run_id: &RunId,
        output_host_dir: &str,
        cache_host_dir: Option<&str>,
    ) -> Result<()> {
        self.create_persistent_volume(run_id, VolumeKind::Output, output_host_dir)
            .await?;
        if let Some(cache_dir) = cache_host_dir {
            self.create_persistent_volume(run_id, VolumeKind::Cache, cache_dir)
                .await?;
        }
        Ok(())
    }

    async fn create_persistent_volume(&self, run_id: &RunId, kind: VolumeKind, host_path: &str) -> Result<()> {
        let namespace = crate::model::namespace_name(run_id);
        let pv_name = pv_name(run_id, kind);
        let pvc_name = pvc_name(run_id, kind);

        let mut capacity = BTreeMap::new();
        capacity.insert("storage".to_string(), Quantity(PV_CAPACITY.to_string()));

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(pv_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                capacity: Some(capacity.clone()),
                nfs: Some(NFSVolumeSource {
                    path: host_path.to_string(),
                    server: NFS_SERVER.to_string(),
                    ..Default::default()
                }),
                storage_class_name: Some("nfs".to_string()),
                persistent_volume_reclaim_policy: Some("Retain".to_string()),
                volume_mode: Some("Filesystem".to_string()),
                ..Default::default()
            }),
            status: None,
        };
        self.pvs().create(&PostParams::default(), &pv).await?;

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_name),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                    requests: Some(capacity),
                    ..Default::default()
                }),
                storage_class_name: Some("nfs".to_string()),
                volume_name: Some(pv_name),
                volume_mode: Some("Filesystem".to_string()),
                ..Default::default()
            }),
            status: None,
        };
        self.pvcs(&namespace)
            .create(&PostParams::default(), &pvc)
            .await?;
        Ok(())
    }

    /// Create the run's pod: image, env, output mount, optional cache
    /// mount, GPU resources (spec.md §4.E).
    pub async fn create_pod(
        &self,
        run_id: &RunId,
        image_ref: &str,
        envs: &BTreeMap<String, String>,
        gpu: bool,
        cache_mount_path: Option<&str>,
    ) -> Result<()> {
        let namespace = crate::model::namespace_name(run_id);
        let pod_name = format!("secd-{run_id}");

        let mut volumes = vec![Volume {
            name: format!("vol-{run_id}-output"),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(run_id, VolumeKind::Output),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut volume_mounts = vec![VolumeMount {
            name: format!("vol-{run_id}-output"),
            mount_path: "/output".to_string(),
            ..Default::default()
        }];

        if let Some(mount_path) = cache_mount_path {
            volumes.push(Volume {
                name: format!("vol-{run_id}-cache"),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(run_id, VolumeKind::Cache),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: format!("vol-{run_id}-cache"),
                mount_path: mount_path.to_string(),
                ..Default::default()
            });
        }

        let mut resources = ResourceRequirements::default();
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        if gpu {
            let mut gpu_quantity = BTreeMap::new();
            gpu_quantity.insert("nvidia.com/gpu".to_string(), Quantity("1".to_string()));
            resources.limits = Some(gpu_quantity.clone());
            resources.requests = Some(gpu_quantity);
            labels.insert("gpu".to_string(), "true".to_string());
        }

        let env = envs
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: pod_name,
                    image: Some(image_ref.to_string()),
                    env: Some(env),
                    volume_mounts: Some(volume_mounts),
                    resources: Some(resources),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: None,
        };

        self.pods(&namespace)
            .create(&PostParams::default(), &pod)
            .await?;
        Ok(())
    }

    /// Whether a namespace is one this controller owns: carries the
    /// `secd-` prefix and both lifecycle annotations (spec.md §3, §9 Open
    /// Question 4). The `app.kubernetes.io/managed-by` label is applied to
    /// every namespace this driver creates and used to narrow the initial
    /// cluster list to a selector instead of scanning every namespace, but
    /// it is not part of the "managed" definition itself — a namespace
    /// satisfying the prefix+annotations shape is managed whether or not
    /// the label happens to be present.
    pub fn is_managed(namespace: &Namespace) -> bool {
        let name_matches = namespace
            .metadata
            .name
            .as_deref()
            .is_some_and(|n| n.starts_with(NAMESPACE_PREFIX));
        let annotations_present = namespace
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key("userid") && a.contains_key("rununtil"));
        name_matches && annotations_present
    }

    fn managed_namespaces_params() -> ListParams {
        ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
    }

    /// Best-effort teardown of a single run's namespace and both possible
    /// PVs, tolerating any resource that was never created. Used by the
    /// launch pipeline's compensating cleanup on a failed launch (spec.md
    /// §9 REDESIGN FLAGS), distinct from [`Self::list_terminal`]'s
    /// reaping of completed runs.
    pub async fn delete_namespace_if_exists(&self, run_id: &RunId) -> Result<()> {
        let namespace = crate::model::namespace_name(run_id);
        match self.namespaces().delete(&namespace, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        for kind in [VolumeKind::Output, VolumeKind::Cache] {
            let _ = self.pvs().delete(&pv_name(run_id, kind), &DeleteParams::default()).await;
        }
        Ok(())
    }

    /// For every managed namespace owned by `user_id`, delete the
    /// namespace and its output PV. Exposed but not wired into the
    /// admission pipeline by default (spec.md §9 Open Question 1).
    pub async fn delete_by_user(&self, user_id: &str) -> Result<Vec<RunId>> {
        let mut deleted = Vec::new();
        let namespaces = self
            .namespaces()
            .list(&Self::managed_namespaces_params())
            .await?;

        for namespace in namespaces.items {
            if !Self::is_managed(&namespace) {
                continue;
            }
            let owner = namespace
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("userid"));
            if owner.map(String::as_str) != Some(user_id) {
                continue;
            }
            let Some(name) = namespace.metadata.name.clone() else {
                continue;
            };
            let Some(run_id) = crate::model::run_id_from_namespace(&name) else {
                continue;
            };

            info!("deleting namespace {name} - new push by user {user_id}");
            self.namespaces().delete(&name, &DeleteParams::default()).await?;
            let _ = self
                .pvs()
                .delete(&pv_name(&run_id, VolumeKind::Output), &DeleteParams::default())
                .await;
            deleted.push(run_id);
        }
        Ok(deleted)
    }

    /// For every managed namespace whose deadline has passed or whose
    /// single pod has succeeded, delete the namespace and best-effort
    /// delete its output PV (spec.md §4.E).
    pub async fn list_terminal(&self) -> Result<Vec<RunId>> {
        let mut terminal = Vec::new();
        let namespaces = self
            .namespaces()
            .list(&Self::managed_namespaces_params())
            .await?;

        for namespace in namespaces.items {
            if !Self::is_managed(&namespace) {
                continue;
            }
            let Some(name) = namespace.metadata.name.clone() else {
                continue;
            };
            let Some(run_id) = crate::model::run_id_from_namespace(&name) else {
                continue;
            };

            let expired = namespace
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("rununtil"))
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|deadline| Utc::now() > deadline);

            let completed = match self.pods(&name).list(&ListParams::default()).await {
                Ok(pods) => pods
                    .items
                    .first()
                    .and_then(|p| p.status.as_ref())
                    .and_then(|s| s.phase.as_deref())
                    == Some("Succeeded"),
                Err(e) => {
                    warn!("failed to list pods in {name}: {e}");
                    false
                }
            };

            if expired || completed {
                info!("reaping namespace {name} (expired={expired}, completed={completed})");
                self.namespaces().delete(&name, &DeleteParams::default()).await?;
                if let Err(e) = self
                    .pvs()
                    .delete(&pv_name(&run_id, VolumeKind::Output), &DeleteParams::default())
                    .await
                {
                    warn!("failed to delete output PV for {name}: {e}");
                }
                terminal.push(run_id);
            }
        }
        Ok(terminal)
    }
}
