//! Image Builder (component D): builds a run's image from its cloned
//! working tree and pushes it to the configured registry.
//!
//! Grounded in `original_source/src/docker_service.py`, which shells out to
//! the Docker SDK for `build`, `login`, `push`, a best-effort `remove`, and a
//! dangling-image sweep. `bollard` talks to the same daemon over its Unix
//! socket API instead of going through a Python SDK, and the build context
//! is assembled as an in-memory tar archive the way `bollard`'s own docs and
//! the wider ecosystem (see `other_examples/manifests/Qovery-engine`) do it.

use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, ListImagesOptions, PushImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::config::RegistrySettings;
use crate::error::{Error, Result};

pub struct ImageBuilder {
    docker: Docker,
    credentials: DockerCredentials,
}

impl ImageBuilder {
    pub fn connect(settings: &RegistrySettings) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let credentials = DockerCredentials {
            username: Some(settings.username.clone()),
            password: Some(settings.password.clone()),
            serveraddress: Some(settings.url.clone()),
            ..Default::default()
        };
        Ok(Self { docker, credentials })
    }

    /// Build `image_ref` from the Dockerfile at the root of `repo_workdir`.
    pub async fn build(&self, repo_workdir: &str, image_ref: &str) -> Result<()> {
        info!("building image {image_ref}");
        let tar = tar_directory(repo_workdir)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_ref.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(tar.into()));
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| {
                Error::ProvisionFailed(format!("error building image {image_ref}: {e}"))
            })?;
            if let Some(error) = info.error {
                return Err(Error::ProvisionFailed(format!(
                    "error building image {image_ref}: {error}"
                )));
            }
        }
        Ok(())
    }

    /// Push `image_ref`, remove the local copy, and sweep dangling images
    /// (spec.md §4.D).
    pub async fn push_and_cleanup(&self, image_ref: &str) -> Result<()> {
        info!("pushing image {image_ref}");
        let (name, tag) = split_image_ref(image_ref);

        let options = PushImageOptions { tag: tag.to_string() };
        let mut stream = self
            .docker
            .push_image(name, Some(options), Some(self.credentials.clone()));
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| {
                Error::ProvisionFailed(format!("error pushing image {image_ref}: {e}"))
            })?;
            if let Some(error) = info.error {
                return Err(Error::ProvisionFailed(format!(
                    "error pushing image {image_ref}: {error}"
                )));
            }
        }

        if let Err(e) = self
            .docker
            .remove_image(image_ref, None::<RemoveImageOptions>, None)
            .await
        {
            warn!("failed to remove local image {image_ref} after push: {e}");
        }

        self.prune_dangling().await
    }

    /// Remove every untagged (`<none>:<none>`) image on the daemon.
    pub async fn prune_dangling(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let options = ListImagesOptions {
            filters,
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        for image in images {
            if let Err(e) = self
                .docker
                .remove_image(&image.id, None::<RemoveImageOptions>, None)
                .await
            {
                warn!("failed to remove dangling image {}: {e}", image.id);
            }
        }
        Ok(())
    }
}

/// `name:tag` split on the final colon, defaulting to `latest` when absent.
fn split_image_ref(image_ref: &str) -> (&str, &str) {
    match image_ref.rsplit_once(':') {
        Some((name, tag)) => (name, tag),
        None => (image_ref, "latest"),
    }
}

fn tar_directory(root: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", Path::new(root))
        .map_err(Error::IoError)?;
    builder.into_inner().map_err(Error::IoError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_ref_separates_tag() {
        assert_eq!(
            split_image_ref("registry.example.com/secd/run:abc123"),
            ("registry.example.com/secd/run", "abc123")
        );
    }

    #[test]
    fn split_image_ref_defaults_to_latest() {
        assert_eq!(
            split_image_ref("registry.example.com/secd/run"),
            ("registry.example.com/secd/run", "latest")
        );
    }

    #[test]
    fn tar_directory_includes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), b"FROM scratch\n").unwrap();
        let bytes = tar_directory(dir.path().to_str().unwrap()).unwrap();
        assert!(!bytes.is_empty());
    }
}
