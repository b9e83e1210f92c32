//! Registry liveness / protocol check

use super::transport::AuthChallenge;
use super::Registry;
use crate::error::{RegscanError, Result};
use reqwest::StatusCode;

/// Domains that never answer the ping usefully; the check is skipped for
/// them entirely.
const UNPINGABLE_SUFFIXES: &[&str] = &["gcr.io"];

impl Registry {
    /// Whether this registry is worth pinging at all.
    pub fn pingable(&self) -> bool {
        let host = self.domain().split('/').next().unwrap_or_default();
        let host = host.split(':').next().unwrap_or_default();
        !UNPINGABLE_SUFFIXES
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
    }

    /// Contacts `/v2/` to make sure the target speaks the Docker v2 registry
    /// protocol. Succeeds on a `Docker-Distribution-API-Version: registry/2.*`
    /// header, or on a 401 carrying a parseable auth challenge, since many
    /// registries demand auth even for the version header.
    pub async fn ping(&self) -> Result<()> {
        let url = self.endpoint("/v2/");
        tracing::debug!(url, "pinging registry");

        // A bare client call: the ping must observe the raw 401, not the
        // transport chain's token exchange.
        let response = self.transport().client().get(&url).send().await?;

        let version_header = response
            .headers()
            .get("Docker-Distribution-API-Version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if version_header.starts_with("registry/2.") {
            return Ok(());
        }

        if response.status() == StatusCode::UNAUTHORIZED
            && AuthChallenge::from_response(&response)?.is_some()
        {
            return Ok(());
        }

        Err(RegscanError::Validation(format!(
            "{} does not return header Docker-Distribution-API-Version: registry/2.0",
            self.domain()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOptions;

    async fn registry_for(domain: &str) -> Registry {
        Registry::builder(domain)
            .with_options(RegistryOptions { skip_ping: true, ..Default::default() })
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_gcr_is_unpingable() {
        assert!(!registry_for("gcr.io").await.pingable());
        assert!(!registry_for("us.gcr.io").await.pingable());
    }

    #[tokio::test]
    async fn test_regular_registries_are_pingable() {
        assert!(registry_for("r.j3ss.co").await.pingable());
        assert!(registry_for("localhost:5000").await.pingable());
        assert!(registry_for("notgcr.io").await.pingable());
    }
}
