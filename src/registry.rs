use crate::config::Config;
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol, ImageData,
};
use oci_distribution::manifest::{
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE, IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE, IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE, OciDescriptor,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info};

const IMAGE_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
const IMAGE_LAYER_NONDISTRIBUTABLE_ZSTD_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

const ACCEPTED_LAYER_MEDIA_TYPES: [&str; 8] = [
    IMAGE_LAYER_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_ZSTD_MEDIA_TYPE,
    IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE,
    IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_NONDISTRIBUTABLE_ZSTD_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

const ACCEPTED_MANIFEST_MEDIA_TYPES: [&str; 4] = [
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },
    #[error("failed to pull {reference}: {message}")]
    Pull { reference: String, message: String },
    #[error("failed to push {reference}: {message}")]
    Push { reference: String, message: String },
}

/// Basic auth credentials for the backup registry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Copies images between registries.
pub trait RegistryClient: Send + Sync {
    /// A fully pulled image: manifest, config and every layer.
    type Image: Send;

    /// Pulls `reference` anonymously from its source registry.
    fn pull(
        &self,
        reference: &ImageReference,
    ) -> impl Future<Output = Result<Self::Image, RegistryError>> + Send;

    fn push(
        &self,
        image: Self::Image,
        target: &ImageReference,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

/// How an image travels from its source to the backup registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    /// Pulled through the image API; the manifest is re-serialised on push.
    Rebuilt,
    /// Manifests are copied byte for byte so a pinned digest still resolves.
    Verbatim,
}

impl Transfer {
    fn for_reference(reference: &ImageReference) -> Self {
        if reference.digest.is_some() {
            Transfer::Verbatim
        } else {
            Transfer::Rebuilt
        }
    }
}

pub enum PulledImage {
    Rebuilt(ImageData),
    Verbatim(RawImage),
}

pub struct RawImage {
    manifest: RawManifest,
    /// Platform manifests of an index, pushed before the index itself.
    children: Vec<RawManifest>,
    /// `(digest, content)` of every config and layer blob.
    blobs: Vec<(String, Vec<u8>)>,
}

struct RawManifest {
    digest: String,
    media_type: String,
    bytes: Vec<u8>,
}

/// The parts of an image manifest or index needed to copy it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    media_type: Option<String>,
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

impl ManifestDocument {
    fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn is_index(&self) -> bool {
        match self.media_type.as_deref() {
            Some(media_type) => {
                media_type == OCI_IMAGE_INDEX_MEDIA_TYPE
                    || media_type == IMAGE_MANIFEST_LIST_MEDIA_TYPE
            }
            None => !self.manifests.is_empty(),
        }
    }

    fn media_type(&self) -> &str {
        match self.media_type.as_deref() {
            Some(media_type) => media_type,
            None if self.is_index() => OCI_IMAGE_INDEX_MEDIA_TYPE,
            None => OCI_IMAGE_MEDIA_TYPE,
        }
    }

    fn blobs(&self) -> impl Iterator<Item = &OciDescriptor> {
        self.config.iter().chain(&self.layers)
    }
}

fn pull_failed(reference: impl Display, error: impl Display) -> RegistryError {
    RegistryError::Pull {
        reference: reference.to_string(),
        message: error.to_string(),
    }
}

fn push_failed(reference: impl Display, error: impl Display) -> RegistryError {
    RegistryError::Push {
        reference: reference.to_string(),
        message: error.to_string(),
    }
}

pub struct OciRegistryClient {
    client: Client,
}

pub fn create_client(config: &Config) -> Result<OciRegistryClient> {
    info!("Initializing OCI registry client");
    let mut extra_root_certificates = Vec::new();
    for file_path in &config.tls.ca_certificate_paths {
        let data = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        extra_root_certificates.push(Certificate {
            encoding: CertificateEncoding::Pem,
            data,
        });
    }

    let protocol = if config.registry.insecure {
        info!(
            "Using plain HTTP for backup registry {}",
            config.registry.host
        );
        ClientProtocol::HttpsExcept(vec![config.registry.host.clone()])
    } else {
        ClientProtocol::Https
    };

    let client = Client::new(ClientConfig {
        protocol,
        extra_root_certificates,
        ..Default::default()
    });
    Ok(OciRegistryClient { client })
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference, RegistryError> {
    let reference = reference.to_string();
    reference
        .parse::<Reference>()
        .map_err(|e| RegistryError::InvalidReference {
            message: e.to_string(),
            reference,
        })
}

fn with_digest(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

impl OciRegistryClient {
    async fn pull_verbatim(&self, reference: &Reference) -> Result<RawImage, RegistryError> {
        let (manifest, document) = self.pull_raw_manifest(reference).await?;
        let mut image = RawImage {
            manifest,
            children: Vec::new(),
            blobs: Vec::new(),
        };

        if !document.is_index() {
            self.pull_blobs(reference, &document, &mut image.blobs).await?;
            return Ok(image);
        }

        for entry in &document.manifests {
            let child_ref = with_digest(reference, &entry.digest);
            let (child, child_document) = self.pull_raw_manifest(&child_ref).await?;
            if child_document.is_index() {
                return Err(pull_failed(&child_ref, "nested image indexes are not supported"));
            }
            self.pull_blobs(&child_ref, &child_document, &mut image.blobs)
                .await?;
            image.children.push(child);
        }
        debug!(
            "Pulled index {} with {} platform manifests",
            reference,
            image.children.len()
        );
        Ok(image)
    }

    async fn pull_raw_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(RawManifest, ManifestDocument), RegistryError> {
        let (bytes, digest) = self
            .client
            .pull_manifest_raw(
                reference,
                &RegistryAuth::Anonymous,
                &ACCEPTED_MANIFEST_MEDIA_TYPES,
            )
            .await
            .map_err(|e| pull_failed(reference, e))?;
        let document = ManifestDocument::parse(&bytes).map_err(|e| pull_failed(reference, e))?;
        let manifest = RawManifest {
            digest,
            media_type: document.media_type().to_string(),
            bytes,
        };
        Ok((manifest, document))
    }

    async fn pull_blobs(
        &self,
        reference: &Reference,
        document: &ManifestDocument,
        blobs: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<(), RegistryError> {
        for descriptor in document.blobs() {
            if blobs.iter().any(|(digest, _)| *digest == descriptor.digest) {
                continue;
            }
            let mut data = Vec::new();
            self.client
                .pull_blob(reference, descriptor, &mut data)
                .await
                .map_err(|e| pull_failed(format!("{}@{}", reference, descriptor.digest), e))?;
            blobs.push((descriptor.digest.clone(), data));
        }
        Ok(())
    }

    async fn push_verbatim(
        &self,
        image: RawImage,
        target: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<(), RegistryError> {
        let oci_ref = to_oci_reference(target)?;
        self.client
            .auth(&oci_ref, auth, RegistryOperation::Push)
            .await
            .map_err(|e| push_failed(target, e))?;

        for (digest, data) in &image.blobs {
            self.client
                .push_blob(&oci_ref, data, digest)
                .await
                .map_err(|e| push_failed(format!("{}@{}", oci_ref, digest), e))?;
        }
        for child in image.children {
            let child_ref = with_digest(&oci_ref, &child.digest);
            self.push_raw_manifest(&child_ref, &child).await?;
        }

        self.push_raw_manifest(&oci_ref, &image.manifest).await?;
        if target.tag.is_some() {
            // tag and digest: make the tag resolve as well
            let tagged = to_oci_reference(&ImageReference {
                digest: None,
                ..target.clone()
            })?;
            self.push_raw_manifest(&tagged, &image.manifest).await?;
        }
        Ok(())
    }

    async fn push_raw_manifest(
        &self,
        reference: &Reference,
        manifest: &RawManifest,
    ) -> Result<(), RegistryError> {
        let content_type = manifest.media_type.parse().map_err(|_| {
            push_failed(
                reference,
                format!("invalid manifest media type {:?}", manifest.media_type),
            )
        })?;
        let url = self
            .client
            .push_manifest_raw(reference, manifest.bytes.clone(), content_type)
            .await
            .map_err(|e| push_failed(reference, e))?;
        debug!("Pushed manifest {} to {}", manifest.digest, url);
        Ok(())
    }
}

impl RegistryClient for OciRegistryClient {
    type Image = PulledImage;

    async fn pull(&self, reference: &ImageReference) -> Result<PulledImage, RegistryError> {
        let oci_ref = to_oci_reference(reference)?;
        info!("Pulling image {} from {}", reference, oci_ref.registry());

        if Transfer::for_reference(reference) == Transfer::Verbatim {
            return self.pull_verbatim(&oci_ref).await.map(PulledImage::Verbatim);
        }

        let image = self
            .client
            .pull(
                &oci_ref,
                &RegistryAuth::Anonymous,
                ACCEPTED_LAYER_MEDIA_TYPES.to_vec(),
            )
            .await
            .map_err(|e| pull_failed(reference, e))?;

        debug!(
            "Pulled {} with {} layers, digest {:?}",
            reference,
            image.layers.len(),
            image.digest
        );
        Ok(PulledImage::Rebuilt(image))
    }

    async fn push(
        &self,
        image: PulledImage,
        target: &ImageReference,
        credentials: &Credentials,
    ) -> Result<(), RegistryError> {
        let auth = RegistryAuth::Basic(
            credentials.username.clone(),
            credentials.password.expose_secret().to_string(),
        );
        info!("Pushing image {}", target);

        let image = match image {
            PulledImage::Rebuilt(image) => image,
            PulledImage::Verbatim(image) => return self.push_verbatim(image, target, &auth).await,
        };

        let oci_ref = to_oci_reference(target)?;
        let response = self
            .client
            .push(&oci_ref, &image.layers, image.config, &auth, image.manifest)
            .await
            .map_err(|e| push_failed(target, e))?;

        debug!("Pushed manifest to {}", response.manifest_url);
        Ok(())
    }
}
