//! Client for the Docker Registry HTTP API v2 / OCI Distribution protocol

pub mod blob;
pub mod manifest;
pub mod paginate;
pub mod ping;
pub mod transport;

use crate::error::{RegscanError, Result};
use crate::reference::ImageReference;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use transport::{translate_error, Transport};

/// Options for a new registry client.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Default to http:// instead of https:// for scheme-less domains.
    pub non_ssl: bool,
    /// Skip the construction-time ping.
    pub skip_ping: bool,
    /// Uniform timeout applied to every outbound request.
    pub timeout: Duration,
    /// Additional headers merged into every outgoing request.
    pub headers: HashMap<String, String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            non_ssl: false,
            skip_ping: false,
            timeout: Duration::from_secs(60),
            headers: HashMap::new(),
        }
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    domain: String,
    username: String,
    password: String,
    opt: RegistryOptions,
}

impl RegistryBuilder {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            username: String::new(),
            password: String::new(),
            opt: RegistryOptions::default(),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_options(mut self, opt: RegistryOptions) -> Self {
        self.opt = opt;
        self
    }

    /// Builds the client and, unless skipped or the registry is known to be
    /// unpingable, pings it once to verify it speaks the v2 protocol.
    pub async fn build(self) -> Result<Registry> {
        let url = normalize_url(&self.domain, self.opt.non_ssl);
        let domain = strip_protocol(&url);

        let mut builder = Client::builder().timeout(self.opt.timeout);
        if self.opt.insecure {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder
            .build()
            .map_err(|e| RegscanError::Network(format!("building http client failed: {}", e)))?;

        let transport = Transport::new(
            client,
            self.username.clone(),
            self.password.clone(),
            self.opt.headers.clone(),
        );

        let registry = Registry {
            url,
            domain,
            username: self.username,
            password: self.password,
            transport,
            opt: self.opt,
        };

        if registry.pingable() && !registry.opt.skip_ping {
            registry.ping().await?;
        }

        Ok(registry)
    }
}

/// Client for a single target registry. Constructed once per registry and
/// safe for concurrent read-only calls; tokens are per-call and never shared.
#[derive(Debug, Clone)]
pub struct Registry {
    url: String,
    domain: String,
    username: String,
    password: String,
    transport: Transport,
    opt: RegistryOptions,
}

impl Registry {
    pub fn builder(domain: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new(domain)
    }

    /// The registry base URL including scheme.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The registry domain without scheme.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Concatenates a path onto the registry base URL.
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    /// Fully qualified blob URL for handing to an external scanner.
    pub fn blob_url(&self, repository: &str, digest: &str) -> String {
        self.endpoint(&format!("/v2/{}/blobs/{}", repository, digest))
    }

    /// Authorization headers a third party needs to fetch the given URL.
    pub async fn headers(&self, url: &str) -> Result<HashMap<String, String>> {
        self.transport.headers(url).await
    }

    /// GET a JSON body through the transport chain, returning the decoded
    /// value together with the response headers.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        accept: Option<&str>,
    ) -> Result<(T, HeaderMap)> {
        let mut request = self.transport.client().get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        let request = request
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;

        let response = self.transport.execute(request).await?;
        tracing::debug!(url, status = %response.status(), "registry request");

        let response = translate_error(response, url).await?;
        let headers = response.headers().clone();
        let body = response.json::<T>().await?;
        Ok((body, headers))
    }

    /// Resolves an image's content digest without downloading the manifest
    /// body when possible: GET then HEAD for `Docker-Content-Digest`, with a
    /// final fallback that computes the digest over the manifest payload.
    pub async fn digest(&self, image: &ImageReference, mediatypes: &[&str]) -> Result<String> {
        if let Some(digest) = &image.digest {
            // Already content-addressed.
            return Ok(digest.clone());
        }

        let url = self.endpoint(&format!("/v2/{}/manifests/{}", image.path, image.reference()));
        let accept = if mediatypes.is_empty() {
            manifest::MEDIA_TYPE_SCHEMA2.to_string()
        } else {
            mediatypes.join(", ")
        };

        for method in [reqwest::Method::GET, reqwest::Method::HEAD] {
            let request = self
                .transport
                .client()
                .request(method.clone(), &url)
                .header(reqwest::header::ACCEPT, &accept)
                .build()
                .map_err(|e| RegscanError::Validation(e.to_string()))?;

            let response = self.transport.execute(request).await?;
            let status = response.status();
            if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
                return Err(RegscanError::UnexpectedStatus {
                    status,
                    message: format!("resolving digest for {} failed", image),
                });
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(RegscanError::NotFound(image.to_string()));
            }

            if let Some(header) = response.headers().get("Docker-Content-Digest") {
                let value = header
                    .to_str()
                    .map_err(|e| RegscanError::Parse(format!("invalid digest header: {}", e)))?;
                return crate::digest::DigestUtils::parse(value);
            }
        }

        // Some registries never set the header; hash the canonical payload.
        let payload = self.manifest_payload(&image.path, image.reference(), &accept).await?;
        Ok(crate::digest::DigestUtils::compute_digest(&payload))
    }

    async fn manifest_payload(&self, repository: &str, reference: &str, accept: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        let request = self
            .transport
            .client()
            .get(&url)
            .header(reqwest::header::ACCEPT, accept)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;
        let response = self.transport.execute(request).await?;
        let response = translate_error(response, &url).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn normalize_url(domain: &str, non_ssl: bool) -> String {
    let trimmed = domain.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else if non_ssl {
        format!("http://{}", trimmed)
    } else {
        format!("https://{}", trimmed)
    }
}

fn strip_protocol(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("r.j3ss.co", false), "https://r.j3ss.co");
        assert_eq!(normalize_url("r.j3ss.co/", false), "https://r.j3ss.co");
        assert_eq!(normalize_url("localhost:5000", true), "http://localhost:5000");
        assert_eq!(normalize_url("http://localhost:5000", false), "http://localhost:5000");
    }

    #[test]
    fn test_strip_protocol() {
        assert_eq!(strip_protocol("https://r.j3ss.co"), "r.j3ss.co");
        assert_eq!(strip_protocol("http://localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_blob_url() {
        let transport = Transport::new(Client::new(), String::new(), String::new(), HashMap::new());
        let registry = Registry {
            url: "https://r.j3ss.co".to_string(),
            domain: "r.j3ss.co".to_string(),
            username: String::new(),
            password: String::new(),
            transport,
            opt: RegistryOptions::default(),
        };
        assert_eq!(
            registry.blob_url("htop", "sha256:deadbeef"),
            "https://r.j3ss.co/v2/htop/blobs/sha256:deadbeef"
        );
    }
}
