//! Blob (layer) operations and manifest deletion

use super::transport::translate_error;
use super::Registry;
use crate::error::{RegscanError, Result};
use reqwest::StatusCode;
use url::Url;

impl Registry {
    /// Downloads a layer blob by digest.
    pub async fn download_layer(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let url = self.blob_url(repository, digest);
        tracing::debug!(url, repository, digest, "downloading layer");

        let request = self
            .transport()
            .client()
            .get(&url)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;
        let response = self.transport().execute(request).await?;
        let response = translate_error(response, &url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Uploads a layer blob: POST to open an upload session, then PUT the
    /// content with the digest as a query parameter.
    pub async fn upload_layer(
        &self,
        repository: &str,
        digest: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut upload_url = self.initiate_upload(repository).await?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        tracing::debug!(url = %upload_url, repository, digest, "uploading layer");

        let request = self
            .transport()
            .client()
            .put(upload_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;

        let response = self.transport().execute(request).await?;
        translate_error(response, upload_url.as_str()).await?;
        Ok(())
    }

    /// Whether the registry holds a blob with the given digest. A 404 is a
    /// clean `false`, not an error.
    pub async fn has_layer(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        tracing::debug!(url, repository, digest, "checking layer");

        let request = self
            .transport()
            .client()
            .head(&url)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;
        let response = self.transport().execute(request).await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegscanError::UnexpectedStatus {
                status,
                message: format!("checking layer {} failed", digest),
            }),
        }
    }

    /// Removes a manifest reference from the registry. Success on 202; a 404
    /// also succeeds since "already gone" satisfies the caller's intent.
    pub async fn delete(&self, repository: &str, reference: &str) -> Result<()> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        tracing::debug!(url, repository, reference, "deleting manifest");

        let request = self
            .transport()
            .client()
            .delete(&url)
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;
        let response = self.transport().execute(request).await?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(()),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(RegscanError::UnexpectedStatus { status, message })
            }
        }
    }

    /// Opens an upload session and returns the session location.
    async fn initiate_upload(&self, repository: &str) -> Result<Url> {
        let url = self.endpoint(&format!("/v2/{}/blobs/uploads/", repository));
        tracing::debug!(url, repository, "initiating upload");

        let request = self
            .transport()
            .client()
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .build()
            .map_err(|e| RegscanError::Validation(e.to_string()))?;
        let response = self.transport().execute(request).await?;
        let response = translate_error(response, &url).await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RegscanError::UnexpectedStatus {
                    status: response.status(),
                    message: "no Location header in upload response".to_string(),
                }
            })?;

        let location_url = if location.starts_with('/') {
            Url::parse(&self.endpoint(location))?
        } else {
            Url::parse(location)?
        };

        Ok(location_url)
    }
}
