//! Manifest fetch and upload
//!
//! Manifests are polymorphic over schema 1 (signed, per-layer history
//! blobs), schema 2 (descriptor lists), and manifest lists / OCI indexes
//! (multi-architecture). The schema version declared by the decoded body
//! must match the variant requested; a mismatch is an error, never a silent
//! coercion.

use super::Registry;
use crate::error::{RegscanError, Result};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// A content descriptor: media type, size, and digest of a blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: String,
}

/// A schema 2 manifest: config descriptor plus a flat ordered layer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestV2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// A signed schema 1 manifest. Layers are listed child-first and chained to
/// their parents through the embedded history blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestV1 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<V1History>,
    #[serde(default)]
    pub signatures: Vec<serde_json::Value>,
}

/// One platform entry of a manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformManifest {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A manifest list / OCI index over per-platform manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<PlatformManifest>,
}

/// A manifest in whichever schema the registry returned.
#[derive(Debug, Clone)]
pub enum Manifest {
    V1(ManifestV1),
    V2(ManifestV2),
    List(ManifestList),
}

impl Registry {
    /// Fetches a manifest in whatever schema the registry prefers, selected
    /// by content negotiation.
    pub async fn manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "fetching manifest");

        let accept = [
            MEDIA_TYPE_SCHEMA2,
            MEDIA_TYPE_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_SCHEMA1,
        ]
        .join(", ");

        let (body, headers): (serde_json::Value, _) = self.get_json(&url, Some(&accept)).await?;

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        decode_manifest(&content_type, body)
    }

    /// Fetches the schema 1 manifest for a reference.
    pub async fn manifest_v1(&self, repository: &str, reference: &str) -> Result<ManifestV1> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "fetching v1 manifest");

        let (manifest, _): (ManifestV1, _) = self.get_json(&url, Some(MEDIA_TYPE_SCHEMA1)).await?;
        if manifest.schema_version != 1 {
            return Err(RegscanError::UnexpectedSchemaVersion);
        }
        Ok(manifest)
    }

    /// Fetches the schema 2 manifest for a reference.
    pub async fn manifest_v2(&self, repository: &str, reference: &str) -> Result<ManifestV2> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "fetching v2 manifest");

        let (manifest, _): (ManifestV2, _) = self.get_json(&url, Some(MEDIA_TYPE_SCHEMA2)).await?;
        if manifest.schema_version != 2 {
            return Err(RegscanError::UnexpectedSchemaVersion);
        }
        Ok(manifest)
    }

    /// Fetches the manifest list for a reference.
    pub async fn manifest_list(&self, repository: &str, reference: &str) -> Result<ManifestList> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "fetching manifest list");

        let accept = format!("{}, {}", MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX);
        let (list, _): (ManifestList, _) = self.get_json(&url, Some(&accept)).await?;
        if list.schema_version != 2 {
            return Err(RegscanError::UnexpectedSchemaVersion);
        }
        Ok(list)
    }

    /// Uploads a schema 2 manifest under the given reference.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &ManifestV2,
    ) -> Result<()> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "uploading manifest");

        let body = serde_json::to_vec(manifest)?;
        let request = self
            .transport()
            .client()
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE_SCHEMA2)
            .body(body)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;

        let response = self.transport().execute(request).await?;
        super::transport::translate_error(response, &url).await?;
        Ok(())
    }
}

fn decode_manifest(content_type: &str, body: serde_json::Value) -> Result<Manifest> {
    match content_type {
        MEDIA_TYPE_SCHEMA2 | MEDIA_TYPE_OCI_MANIFEST => {
            Ok(Manifest::V2(serde_json::from_value(body)?))
        }
        MEDIA_TYPE_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => {
            Ok(Manifest::List(serde_json::from_value(body)?))
        }
        MEDIA_TYPE_SCHEMA1 | "application/vnd.docker.distribution.manifest.v1+json" => {
            Ok(Manifest::V1(serde_json::from_value(body)?))
        }
        _ => {
            // No (or an unknown) content type: sniff the declared schema
            // version and shape instead.
            let version = body.get("schemaVersion").and_then(|v| v.as_u64());
            match version {
                Some(1) => Ok(Manifest::V1(serde_json::from_value(body)?)),
                Some(2) if body.get("manifests").is_some() => {
                    Ok(Manifest::List(serde_json::from_value(body)?))
                }
                Some(2) => Ok(Manifest::V2(serde_json::from_value(body)?)),
                _ => Err(RegscanError::UnexpectedSchemaVersion),
            }
        }
    }
}
