//! Clair vulnerability-database scanner
//!
//! Layers are handed to Clair by reference: each one carries its blob URL on
//! the registry plus whatever authorization headers a third party needs to
//! fetch it. The newer v3 ancestry API is preferred; on any v3 error the
//! scan falls back to the per-layer v1 POST API so that either Clair
//! generation works unmodified.

use super::Scanner;
use crate::digest::DigestUtils;
use crate::error::{RegscanError, Result};
use crate::registry::Registry;
use crate::report::{normalize_severity, Vulnerability, VulnerabilityReport};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Client for a Clair-compatible vulnerability database service.
#[derive(Debug, Clone)]
pub struct Clair {
    url: String,
    client: Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClairError {
    #[serde(rename = "Message", default)]
    message: String,
}

/// A layer as Clair's v1 API sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClairLayer {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Path", default, skip_serializing_if = "String::is_empty")]
    path: String,
    #[serde(rename = "Headers", default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(rename = "ParentName", default, skip_serializing_if = "String::is_empty")]
    parent_name: String,
    #[serde(rename = "Format", default, skip_serializing_if = "String::is_empty")]
    format: String,
    #[serde(rename = "Features", default, skip_serializing_if = "Vec::is_empty")]
    features: Vec<ClairFeature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClairFeature {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<Vulnerability>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerEnvelope {
    #[serde(rename = "Layer", skip_serializing_if = "Option::is_none")]
    layer: Option<ClairLayer>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    error: Option<ClairError>,
}

/// A layer as the v3 ancestry API sees it.
#[derive(Debug, Clone, Serialize)]
struct AncestryLayer {
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Headers")]
    headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PostAncestryRequest {
    #[serde(rename = "AncestryName")]
    ancestry_name: String,
    #[serde(rename = "Format")]
    format: String,
    #[serde(rename = "Layers")]
    layers: Vec<AncestryLayer>,
}

#[derive(Debug, Serialize)]
struct GetAncestryRequest {
    #[serde(rename = "AncestryName")]
    ancestry_name: String,
    #[serde(rename = "WithFeatures")]
    with_features: bool,
    #[serde(rename = "WithVulnerabilities")]
    with_vulnerabilities: bool,
}

#[derive(Debug, Deserialize)]
struct GetAncestryResponse {
    #[serde(rename = "Ancestry", default)]
    ancestry: Option<Ancestry>,
}

#[derive(Debug, Deserialize)]
struct Ancestry {
    #[serde(rename = "Layers", default)]
    layers: Vec<AncestryResponseLayer>,
}

#[derive(Debug, Deserialize)]
struct AncestryResponseLayer {
    #[serde(rename = "DetectedFeatures", default)]
    detected_features: Vec<ClairFeature>,
}

impl Clair {
    pub fn new(url: String, insecure: bool, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if insecure {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder
            .build()
            .map_err(|e| RegscanError::Network(format!("building clair client failed: {}", e)))?;

        Ok(Self { url: url.trim_end_matches('/').to_string(), client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    /// Scans via the v1 per-layer API: POST each layer parent-to-child, then
    /// fetch the analysis of the top (most-derived) layer.
    pub async fn vulnerabilities(
        &self,
        registry: &Registry,
        repo: &str,
        tag: &str,
    ) -> Result<VulnerabilityReport> {
        let layers = filtered_layers(registry, repo, tag).await?;
        if layers.is_empty() {
            tracing::info!(repo, tag, "image has no non-empty layer, skipping scan");
            return Ok(VulnerabilityReport::new(registry.domain(), repo, tag));
        }

        // The registry lists layers child-first; post parents before
        // children by iterating in reverse.
        for index in (0..layers.len()).rev() {
            let layer = self.build_layer(registry, repo, &layers, index).await?;
            self.post_layer(&layer).await?;
        }

        let top = &layers[0];
        let analyzed = self.get_layer(top).await?;

        let raw = analyzed
            .features
            .into_iter()
            .flat_map(|f| f.vulnerabilities)
            .map(normalize_vuln);

        Ok(VulnerabilityReport::from_vulns(registry.domain(), repo, tag, top, raw))
    }

    /// Scans via the v3 ancestry API: one POST carrying every layer, then
    /// one GET for the nested feature/vulnerability tree.
    pub async fn vulnerabilities_v3(
        &self,
        registry: &Registry,
        repo: &str,
        tag: &str,
    ) -> Result<VulnerabilityReport> {
        let layers = filtered_layers(registry, repo, tag).await?;
        if layers.is_empty() {
            tracing::info!(repo, tag, "image has no non-empty layer, skipping scan");
            return Ok(VulnerabilityReport::new(registry.domain(), repo, tag));
        }

        let name = layers[0].clone();

        let mut ancestry_layers = Vec::with_capacity(layers.len());
        for digest in layers.iter().rev() {
            let path = registry.blob_url(repo, digest);
            let headers = registry.headers(&path).await?;
            ancestry_layers.push(AncestryLayer { hash: digest.clone(), path, headers });
        }

        self.post_ancestry(&name, ancestry_layers).await?;
        let ancestry = self.get_ancestry(&name).await?;

        let raw = ancestry
            .layers
            .into_iter()
            .flat_map(|l| l.detected_features)
            .flat_map(|f| f.vulnerabilities)
            .map(normalize_vuln);

        Ok(VulnerabilityReport::from_vulns(registry.domain(), repo, tag, &name, raw))
    }

    async fn build_layer(
        &self,
        registry: &Registry,
        repo: &str,
        layers: &[String],
        index: usize,
    ) -> Result<ClairLayer> {
        // Child-first list: the parent of layer i is layer i+1.
        let parent_name = if index < layers.len() - 1 {
            layers[index + 1].clone()
        } else {
            String::new()
        };

        let path = registry.blob_url(repo, &layers[index]);
        let headers = registry.headers(&path).await?;

        Ok(ClairLayer {
            name: layers[index].clone(),
            path,
            headers,
            parent_name,
            format: "Docker".to_string(),
            features: Vec::new(),
        })
    }

    async fn post_layer(&self, layer: &ClairLayer) -> Result<ClairLayer> {
        let url = self.endpoint("/v1/layers");
        tracing::debug!(url, layer = %layer.name, "posting layer to clair");

        let envelope = LayerEnvelope { layer: Some(layer.clone()), error: None };
        let response = self.client.post(&url).json(&envelope).send().await?;
        let response = check_status(response, "posting layer").await?;

        let body: LayerEnvelope = response.json().await?;
        if let Some(err) = body.error {
            return Err(RegscanError::Scanner(format!("clair error: {}", err.message)));
        }
        body.layer
            .ok_or_else(|| RegscanError::Scanner("clair layer response was empty".to_string()))
    }

    async fn get_layer(&self, name: &str) -> Result<ClairLayer> {
        let url = self.endpoint(&format!(
            "/v1/layers/{}?features=true&vulnerabilities=true",
            name
        ));
        tracing::debug!(url, layer = name, "fetching analyzed layer from clair");

        let response = self.client.get(&url).send().await?;
        let response = check_status(response, "fetching layer").await?;

        let body: LayerEnvelope = response.json().await?;
        if let Some(err) = body.error {
            return Err(RegscanError::Scanner(format!("clair error: {}", err.message)));
        }
        body.layer
            .ok_or_else(|| RegscanError::Scanner("clair layer response was empty".to_string()))
    }

    async fn post_ancestry(&self, name: &str, layers: Vec<AncestryLayer>) -> Result<()> {
        let url = self.endpoint("/v3/ancestry");
        tracing::debug!(url, ancestry = name, layers = layers.len(), "posting ancestry to clair");

        let request = PostAncestryRequest {
            ancestry_name: name.to_string(),
            format: "Docker".to_string(),
            layers,
        };
        let response = self.client.post(&url).json(&request).send().await?;
        check_status(response, "posting ancestry").await?;
        Ok(())
    }

    async fn get_ancestry(&self, name: &str) -> Result<Ancestry> {
        let url = self.endpoint("/v3/ancestry");
        tracing::debug!(url, ancestry = name, "fetching ancestry from clair");

        let request = GetAncestryRequest {
            ancestry_name: name.to_string(),
            with_features: true,
            with_vulnerabilities: true,
        };
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;
        let response = check_status(response, "fetching ancestry").await?;

        let body: GetAncestryResponse = response.json().await?;
        body.ancestry
            .ok_or_else(|| RegscanError::Scanner("ancestry response was empty".to_string()))
    }
}

#[async_trait]
impl Scanner for Clair {
    /// Prefer the v3 ancestry API; on any error fall back to the v1
    /// per-layer API.
    async fn scan_image(
        &self,
        registry: &Registry,
        repo: &str,
        tag: &str,
    ) -> Result<VulnerabilityReport> {
        match self.vulnerabilities_v3(registry, repo, tag).await {
            Ok(report) => Ok(report),
            Err(err) => {
                tracing::debug!(repo, tag, %err, "clair v3 scan failed, retrying with v1 API");
                self.vulnerabilities(registry, repo, tag).await
            }
        }
    }

    fn kind(&self) -> &'static str {
        "clair"
    }
}

/// Fetches the image's layer digests, child-first, with empty layers
/// filtered out. Tries the v2 manifest first and falls back to v1.
async fn filtered_layers(registry: &Registry, repo: &str, tag: &str) -> Result<Vec<String>> {
    match registry.manifest_v2(repo, tag).await {
        Ok(manifest) => Ok(filter_empty(
            manifest.layers.into_iter().map(|l| l.digest),
        )),
        Err(err) => {
            tracing::debug!(repo, tag, %err, "no v2 manifest, falling back to v1");
            let manifest = registry.manifest_v1(repo, tag).await.map_err(|e| {
                RegscanError::Scanner(format!(
                    "getting manifest for {}:{} failed: {}",
                    repo, tag, e
                ))
            })?;
            Ok(filter_empty(
                manifest.fs_layers.into_iter().map(|l| l.blob_sum),
            ))
        }
    }
}

fn filter_empty(digests: impl Iterator<Item = String>) -> Vec<String> {
    digests.filter(|d| !DigestUtils::is_empty_layer(d)).collect()
}

fn normalize_vuln(mut vuln: Vulnerability) -> Vulnerability {
    vuln.severity = normalize_severity(&vuln.severity);
    vuln
}

async fn check_status(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegscanError::Scanner(format!(
        "{} failed with status {}: {}",
        context, status, message
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::EMPTY_LAYER_BLOB_SUM;

    #[test]
    fn test_filter_empty_layers() {
        let layers = vec![
            "sha256:1111111111111111111111111111111111111111111111111111111111111111".to_string(),
            EMPTY_LAYER_BLOB_SUM.to_string(),
            "sha256:2222222222222222222222222222222222222222222222222222222222222222".to_string(),
        ];
        let filtered = filter_empty(layers.into_iter());
        assert_eq!(filtered.len(), 2);
        assert!(!filtered.iter().any(|d| d == EMPTY_LAYER_BLOB_SUM));
    }

    #[test]
    fn test_filter_all_empty_layers() {
        let layers = vec![EMPTY_LAYER_BLOB_SUM.to_string(), EMPTY_LAYER_BLOB_SUM.to_string()];
        assert!(filter_empty(layers.into_iter()).is_empty());
    }

    #[test]
    fn test_layer_envelope_round_trip() {
        let body = r#"{"Layer":{"Name":"sha256:abc","Features":[{"Name":"openssl","Version":"1.0","Vulnerabilities":[{"Name":"CVE-2014-0160","Severity":"High"}]}]}}"#;
        let envelope: LayerEnvelope = serde_json::from_str(body).unwrap();
        let layer = envelope.layer.unwrap();
        assert_eq!(layer.name, "sha256:abc");
        assert_eq!(layer.features[0].vulnerabilities[0].name, "CVE-2014-0160");
    }

    #[test]
    fn test_error_envelope() {
        let body = r#"{"Error":{"Message":"layer not found"}}"#;
        let envelope: LayerEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.error.unwrap().message, "layer not found");
    }

    #[test]
    fn test_ancestry_response_flattening() {
        let body = r#"{"Ancestry":{"Name":"sha256:top","Layers":[
            {"DetectedFeatures":[{"Name":"musl","Version":"1.1","Vulnerabilities":[
                {"Name":"CVE-1","Severity":"CRITICAL"},{"Name":"CVE-2","Severity":"Low"}]}]},
            {"DetectedFeatures":[]}
        ]}}"#;
        let response: GetAncestryResponse = serde_json::from_str(body).unwrap();
        let vulns: Vec<_> = response
            .ancestry
            .unwrap()
            .layers
            .into_iter()
            .flat_map(|l| l.detected_features)
            .flat_map(|f| f.vulnerabilities)
            .map(normalize_vuln)
            .collect();
        assert_eq!(vulns.len(), 2);
        assert_eq!(vulns[0].severity, "Critical");
    }

    #[test]
    fn test_parent_chain_in_layer_build() {
        // Child-first list: layer 0's parent is layer 1; the last layer has
        // no parent. Exercised indirectly through index arithmetic.
        let layers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let parent_of = |index: usize| -> String {
            if index < layers.len() - 1 { layers[index + 1].clone() } else { String::new() }
        };
        assert_eq!(parent_of(0), "b");
        assert_eq!(parent_of(1), "c");
        assert_eq!(parent_of(2), "");
    }

    mod fallback {
        use super::super::*;
        use crate::registry::manifest::MEDIA_TYPE_SCHEMA2;
        use crate::registry::RegistryOptions;
        use axum::response::IntoResponse;
        use std::future::IntoFuture;
        use std::net::SocketAddr;

        const LAYER: &str =
            "sha256:1111111111111111111111111111111111111111111111111111111111111111";

        // One endpoint playing both roles: a registry serving a schema 2
        // manifest and anonymous blobs, and a clair whose v3 ancestry API is
        // broken while the v1 per-layer API works.
        async fn serve() -> SocketAddr {
            let manifest = format!(
                r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","size":100,"digest":"sha256:2222222222222222222222222222222222222222222222222222222222222222"}},"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":200,"digest":"{}"}}]}}"#,
                MEDIA_TYPE_SCHEMA2, LAYER
            );
            let analyzed = format!(
                r#"{{"Layer":{{"Name":"{}","Features":[{{"Name":"openssl","Version":"1.0","Vulnerabilities":[{{"Name":"CVE-2014-0160","Severity":"High"}}]}}]}}}}"#,
                LAYER
            );
            let posted = format!(r#"{{"Layer":{{"Name":"{}"}}}}"#, LAYER);

            let app = axum::Router::new()
                .route(
                    "/v2/{repo}/manifests/{tag}",
                    axum::routing::get(|| async move { manifest }),
                )
                .route("/v2/{repo}/blobs/{digest}", axum::routing::get(|| async { "" }))
                .route(
                    "/v3/ancestry",
                    axum::routing::post(|| async {
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR
                    }),
                )
                .route("/v1/layers", axum::routing::post(|| async move { posted }))
                .route(
                    "/v1/layers/{name}",
                    axum::routing::get(|| async move { analyzed }),
                );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(axum::serve(listener, app).into_future());
            addr
        }

        #[tokio::test]
        async fn test_scan_falls_back_to_v1_when_v3_fails() {
            let addr = serve().await;
            let base = format!("127.0.0.1:{}", addr.port());

            let registry = Registry::builder(&base)
                .with_options(RegistryOptions {
                    non_ssl: true,
                    skip_ping: true,
                    ..Default::default()
                })
                .build()
                .await
                .unwrap();
            let clair = Clair::new(
                format!("http://{}", base),
                false,
                std::time::Duration::from_secs(5),
            )
            .unwrap();

            let report = clair.scan_image(&registry, "htop", "latest").await.unwrap();
            assert_eq!(report.vulns.len(), 1);
            assert_eq!(report.vulns[0].name, "CVE-2014-0160");
            assert_eq!(report.vulns[0].severity, "High");
            assert_eq!(report.name, LAYER);
        }
    }
}
