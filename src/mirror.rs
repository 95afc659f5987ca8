use crate::filter::NamespaceFilter;
use crate::image_reference::{ImageReference, ParseError};
use crate::registry::{Credentials, RegistryClient, RegistryError};
use crate::scope::{Interrupted, OperationScope};
use thiserror::Error;
use tracing::{debug, info};

/// Process-wide mirroring settings, built once at startup.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub target_registry: String,
    pub credentials: Credentials,
    pub namespaces: NamespaceFilter,
}

impl MirrorConfig {
    /// Textual check only: any reference containing `<target_registry>/` counts as mirrored.
    pub fn is_mirrored(&self, image: &str) -> bool {
        image.contains(&format!("{}/", self.target_registry))
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid image reference {image:?}")]
    Parse {
        image: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to pull {image}")]
    Pull {
        image: String,
        #[source]
        source: RegistryError,
    },
    #[error("failed to push {image} to {target}")]
    Push {
        image: String,
        target: String,
        #[source]
        source: RegistryError,
    },
    #[error("mirroring {image} was interrupted")]
    Interrupted {
        image: String,
        #[source]
        source: Interrupted,
    },
}

/// Copies `image` into the backup registry and returns the reference to use instead.
///
/// Images already in the backup registry are returned unchanged without touching
/// any registry.
pub async fn mirror_image<R: RegistryClient>(
    image: &str,
    config: &MirrorConfig,
    registry: &R,
    scope: &OperationScope,
) -> Result<String, MirrorError> {
    if config.is_mirrored(image) {
        debug!("Image {} is already in {}", image, config.target_registry);
        return Ok(image.to_string());
    }

    let source = ImageReference::parse(image).map_err(|source| MirrorError::Parse {
        image: image.to_string(),
        source,
    })?;
    let target_name = source.mirrored_into(&config.target_registry);
    let target = ImageReference::parse(&target_name).map_err(|source| MirrorError::Parse {
        image: target_name.clone(),
        source,
    })?;

    let interrupted = |source| MirrorError::Interrupted {
        image: image.to_string(),
        source,
    };

    let pulled = scope
        .run(registry.pull(&source))
        .await
        .map_err(interrupted)?
        .map_err(|source| MirrorError::Pull {
            image: image.to_string(),
            source,
        })?;

    scope
        .run(registry.push(pulled, &target, &config.credentials))
        .await
        .map_err(interrupted)?
        .map_err(|source| MirrorError::Push {
            image: image.to_string(),
            target: target_name.clone(),
            source,
        })?;

    info!("Mirrored image {} to {}", image, target_name);
    Ok(target_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRegistry, mirror_config, scope};

    #[tokio::test]
    async fn test_bare_name_is_mirrored_under_target() {
        let registry = FakeRegistry::default();
        let mirrored = mirror_image("nginx:1.21", &mirror_config("backup"), &registry, &scope())
            .await
            .unwrap();
        assert_eq!(mirrored, "backup/nginx:1.21");
        assert_eq!(registry.pulls(), vec!["nginx:1.21"]);
        assert_eq!(registry.pushes(), vec![("nginx:1.21".to_string(), "backup/nginx:1.21".to_string())]);
    }

    #[tokio::test]
    async fn test_leading_path_is_dropped() {
        let registry = FakeRegistry::default();
        let config = mirror_config("backup");
        for (image, expected) in [
            ("library/nginx:1.21", "backup/nginx:1.21"),
            ("quay.io/prometheus/node-exporter:v1.8.0", "backup/node-exporter:v1.8.0"),
            ("localhost:5000/app", "backup/app"),
            (
                "ghcr.io/org/app@sha256:0123456789abcdef",
                "backup/app@sha256:0123456789abcdef",
            ),
        ] {
            let mirrored = mirror_image(image, &config, &registry, &scope()).await.unwrap();
            assert_eq!(mirrored, expected);
        }
        assert_eq!(registry.pushes().len(), 4);
    }

    #[tokio::test]
    async fn test_already_mirrored_image_is_untouched() {
        let registry = FakeRegistry::default();
        let config = mirror_config("backup");
        for image in ["backup/app:v1", "registry.local/backup/app:v1"] {
            let mirrored = mirror_image(image, &config, &registry, &scope()).await.unwrap();
            assert_eq!(mirrored, image);
        }
        assert!(registry.pulls().is_empty());
        assert!(registry.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_mirroring_own_output_is_a_no_op() {
        let registry = FakeRegistry::default();
        let config = mirror_config("mirror.example.com");
        let first = mirror_image("redis:7", &config, &registry, &scope()).await.unwrap();
        let second = mirror_image(&first, &config, &registry, &scope()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.pulls().len(), 1);
        assert_eq!(registry.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reference_fails_without_registry_calls() {
        let registry = FakeRegistry::default();
        let err = mirror_image("nginx:", &mirror_config("backup"), &registry, &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Parse { ref image, .. } if image == "nginx:"));
        assert!(registry.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_skips_push() {
        let registry = FakeRegistry::failing_pull();
        let err = mirror_image("nginx:1.21", &mirror_config("backup"), &registry, &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Pull { .. }));
        assert!(registry.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_push_failure_is_reported() {
        let registry = FakeRegistry::failing_push();
        let err = mirror_image("nginx:1.21", &mirror_config("backup"), &registry, &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Push { ref target, .. } if target == "backup/nginx:1.21"));
    }

    #[tokio::test]
    async fn test_hanging_pull_times_out() {
        let registry = FakeRegistry::hanging_pull();
        let scope = crate::testing::scope_with_timeout(std::time::Duration::from_millis(20));
        let err = mirror_image("nginx:1.21", &mirror_config("backup"), &registry, &scope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Interrupted {
                source: Interrupted::TimedOut(_),
                ..
            }
        ));
        assert!(registry.pushes().is_empty());
    }
}
