//! Vulnerability scanner abstraction
//!
//! One capability, two interchangeable backends: a Clair-style
//! vulnerability-database service and a Trivy-style subprocess scanner. The
//! subprocess scanner takes precedence when both are configured; the
//! database scanner is legacy.

pub mod clair;
pub mod trivy;

use crate::error::Result;
use crate::registry::Registry;
use crate::report::VulnerabilityReport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Scan an image and return a normalized vulnerability report.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan_image(
        &self,
        registry: &Registry,
        repo: &str,
        tag: &str,
    ) -> Result<VulnerabilityReport>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}

/// Scanner backend configuration.
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    /// URL of a Clair-compatible vulnerability database service.
    pub clair_url: Option<String>,
    /// Path to a Trivy-compatible scanner binary.
    pub trivy_location: Option<String>,
    pub insecure: bool,
    pub timeout: Duration,
}

impl ScannerConfig {
    /// Selects the active scanner: subprocess over database scanner, `None`
    /// when neither is configured.
    pub fn build(&self) -> Result<Option<Arc<dyn Scanner>>> {
        if let Some(location) = &self.trivy_location {
            if !location.is_empty() {
                return Ok(Some(Arc::new(trivy::Trivy::new(location.clone()))));
            }
        }
        if let Some(url) = &self.clair_url {
            if !url.is_empty() {
                let client = clair::Clair::new(url.clone(), self.insecure, self.timeout)?;
                return Ok(Some(Arc::new(client)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_scanner_when_unconfigured() {
        let config = ScannerConfig { timeout: Duration::from_secs(5), ..Default::default() };
        assert!(config.build().unwrap().is_none());
    }

    #[test]
    fn test_clair_selected_when_only_clair_configured() {
        let config = ScannerConfig {
            clair_url: Some("http://clair:6060".to_string()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.build().unwrap().unwrap().kind(), "clair");
    }

    #[test]
    fn test_trivy_takes_precedence_over_clair() {
        // Both configured: the subprocess scanner wins.
        let config = ScannerConfig {
            clair_url: Some("http://clair:6060".to_string()),
            trivy_location: Some("/usr/local/bin/trivy".to_string()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.build().unwrap().unwrap().kind(), "trivy");
    }

    #[test]
    fn test_empty_strings_count_as_unconfigured() {
        let config = ScannerConfig {
            clair_url: Some(String::new()),
            trivy_location: Some(String::new()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.build().unwrap().is_none());
    }
}
