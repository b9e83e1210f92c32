//! Trivy subprocess scanner
//!
//! The scanner binary is pointed directly at the fully qualified image
//! reference and performs its own registry authentication, so no per-layer
//! blob access or transport headers are needed here. Structured JSON is
//! captured from the process's standard output.

use super::Scanner;
use crate::error::{RegscanError, Result};
use crate::registry::Registry;
use crate::report::{normalize_severity, Vulnerability, VulnerabilityReport};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// Client for a Trivy-compatible scanner binary.
#[derive(Debug, Clone)]
pub struct Trivy {
    location: String,
}

#[derive(Debug, Deserialize)]
struct TrivyTarget {
    #[serde(rename = "Target", default)]
    target: String,
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID", default)]
    vulnerability_id: String,
    #[serde(rename = "PkgName", default)]
    pkg_name: String,
    #[serde(rename = "InstalledVersion", default)]
    installed_version: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "References", default)]
    references: Vec<String>,
}

impl TrivyVulnerability {
    fn into_vulnerability(self) -> Vulnerability {
        Vulnerability {
            name: self.vulnerability_id,
            namespace: self.pkg_name,
            description: self.description,
            // The report shape carries a single link; trivy reports a list.
            link: self.references.into_iter().next().unwrap_or_default(),
            severity: normalize_severity(&self.severity),
            fixed_by: self.fixed_version,
            metadata: if self.installed_version.is_empty() {
                None
            } else {
                Some(serde_json::json!({ "InstalledVersion": self.installed_version }))
            },
        }
    }
}

impl Trivy {
    pub fn new(location: String) -> Self {
        Self { location }
    }

    fn parse_output(output: &[u8]) -> Result<Vec<TrivyTarget>> {
        serde_json::from_slice(output)
            .map_err(|e| RegscanError::Scanner(format!("parsing trivy output failed: {}", e)))
    }
}

#[async_trait]
impl Scanner for Trivy {
    async fn scan_image(
        &self,
        registry: &Registry,
        repo: &str,
        tag: &str,
    ) -> Result<VulnerabilityReport> {
        let image = format!("{}/{}:{}", registry.domain(), repo, tag);
        tracing::info!(image, "trivy scan starting");

        let output = Command::new(&self.location)
            .arg("-q")
            .arg("-f")
            .arg("json")
            .arg(&image)
            .output()
            .await
            .map_err(|e| RegscanError::Scanner(format!("running trivy failed: {}", e)))?;

        tracing::info!(image, "trivy scan complete");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RegscanError::Scanner(format!(
                "trivy exited with {}: {}",
                output.status, stderr
            )));
        }

        let targets = Self::parse_output(&output.stdout)?;

        // A target's name is only kept for the report label; the first
        // target wins, matching the single-name report shape.
        let name = targets.first().map(|t| t.target.clone()).unwrap_or_default();

        let raw = targets
            .into_iter()
            .flat_map(|t| t.vulnerabilities)
            .map(TrivyVulnerability::into_vulnerability);

        Ok(VulnerabilityReport::from_vulns(registry.domain(), repo, tag, &name, raw))
    }

    fn kind(&self) -> &'static str {
        "trivy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "Target": "alpine:3.10 (alpine 3.10.2)",
            "Type": "alpine",
            "Vulnerabilities": [
                {
                    "VulnerabilityID": "CVE-2019-1549",
                    "PkgName": "openssl",
                    "InstalledVersion": "1.1.1c-r0",
                    "FixedVersion": "1.1.1d-r0",
                    "Severity": "MEDIUM",
                    "Description": "OpenSSL 1.1.1 introduced a rewritten random number generator.",
                    "References": ["https://nvd.nist.gov/vuln/detail/CVE-2019-1549"]
                },
                {
                    "VulnerabilityID": "CVE-2019-1563",
                    "PkgName": "openssl",
                    "InstalledVersion": "1.1.1c-r0",
                    "FixedVersion": "",
                    "Severity": "HIGH",
                    "References": []
                }
            ]
        },
        {
            "Target": "usr/lib/app (gobinary)",
            "Type": "gobinary",
            "Vulnerabilities": [
                {
                    "VulnerabilityID": "CVE-2019-1563",
                    "PkgName": "another-pkg",
                    "Severity": "HIGH"
                }
            ]
        }
    ]"#;

    #[test]
    fn test_parse_output() {
        let targets = Trivy::parse_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].vulnerabilities.len(), 2);
        assert_eq!(targets[0].target, "alpine:3.10 (alpine 3.10.2)");
    }

    #[test]
    fn test_severity_mapping_and_link() {
        let targets = Trivy::parse_output(SAMPLE.as_bytes()).unwrap();
        let vuln = targets
            .into_iter()
            .next()
            .unwrap()
            .vulnerabilities
            .into_iter()
            .next()
            .unwrap()
            .into_vulnerability();
        assert_eq!(vuln.severity, "Medium");
        assert_eq!(vuln.name, "CVE-2019-1549");
        assert_eq!(vuln.namespace, "openssl");
        assert_eq!(vuln.fixed_by, "1.1.1d-r0");
        assert_eq!(vuln.link, "https://nvd.nist.gov/vuln/detail/CVE-2019-1549");
    }

    #[test]
    fn test_same_cve_across_targets_dedupes_in_report() {
        let targets = Trivy::parse_output(SAMPLE.as_bytes()).unwrap();
        let raw: Vec<_> = targets
            .into_iter()
            .flat_map(|t| t.vulnerabilities)
            .map(TrivyVulnerability::into_vulnerability)
            .collect();
        assert_eq!(raw.len(), 3);

        let report = VulnerabilityReport::from_vulns("r.j3ss.co", "alpine", "3.10", "", raw);
        // CVE-2019-1563 appears against two packages; only the first counts.
        assert_eq!(report.vulns.len(), 2);
        assert_eq!(report.bad_vulns, 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Trivy::parse_output(b"not json").is_err());
    }

    #[test]
    fn test_empty_scan_output() {
        let targets = Trivy::parse_output(b"[]").unwrap();
        assert!(targets.is_empty());
    }
}
