//! Vulnerability report aggregation
//!
//! A report is a pure aggregation over a flat vulnerability list: flatten,
//! dedupe by name (first occurrence wins), bucket by severity, and count the
//! bad ones. It is rebuilt from scratch per scan, never mutated
//! incrementally, and running the aggregation twice over the same input
//! yields an identical report aside from the timestamp.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Severity labels in ascending order. Scanner-specific vocabularies are
/// normalized onto this set; unrecognized labels pass through unchanged and
/// form their own buckets.
pub const SEVERITIES: &[&str] = &[
    "Unknown",
    "Negligible",
    "Low",
    "Medium",
    "High",
    "Critical",
    "Defcon1",
];

/// Severities that count as "bad" and drive alerting / exit status.
const BAD_SEVERITIES: &[&str] = &["High", "Critical", "Defcon1"];

/// A single vulnerability, normalized into one shape regardless of which
/// scanner produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "NamespaceName", default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "Link", default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(rename = "Severity", default)]
    pub severity: String,
    #[serde(rename = "FixedBy", default, skip_serializing_if = "String::is_empty")]
    pub fixed_by: String,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The result of a vulnerability scan of one repo:tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    #[serde(rename = "RegistryURL")]
    pub registry_url: String,
    #[serde(rename = "Repo")]
    pub repo: String,
    #[serde(rename = "Tag")]
    pub tag: String,
    /// Scan target name: the top layer digest (clair) or the scan target
    /// (trivy).
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Vulns")]
    pub vulns: Vec<Vulnerability>,
    #[serde(rename = "VulnsBySeverity")]
    pub vulns_by_severity: HashMap<String, Vec<Vulnerability>>,
    #[serde(rename = "BadVulns")]
    pub bad_vulns: usize,
}

impl VulnerabilityReport {
    /// An empty report shell for a repo:tag, timestamped now.
    pub fn new(registry_url: &str, repo: &str, tag: &str) -> Self {
        Self {
            registry_url: registry_url.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            name: String::new(),
            date: chrono::Local::now().to_rfc2822(),
            vulns: Vec::new(),
            vulns_by_severity: HashMap::new(),
            bad_vulns: 0,
        }
    }

    /// Builds the full report from a raw vulnerability sequence: dedupe by
    /// name keeping the first occurrence, group by severity preserving
    /// order, and compute the bad-vulnerability count.
    pub fn from_vulns(
        registry_url: &str,
        repo: &str,
        tag: &str,
        name: &str,
        raw: impl IntoIterator<Item = Vulnerability>,
    ) -> Self {
        let mut report = Self::new(registry_url, repo, tag);
        report.name = name.to_string();

        let mut seen: HashSet<String> = HashSet::new();
        for vuln in raw {
            if seen.insert(vuln.name.clone()) {
                report.vulns.push(vuln);
            }
        }

        for vuln in &report.vulns {
            report
                .vulns_by_severity
                .entry(vuln.severity.clone())
                .or_default()
                .push(vuln.clone());
        }

        report.bad_vulns = BAD_SEVERITIES
            .iter()
            .map(|sev| report.vulns_by_severity.get(*sev).map_or(0, Vec::len))
            .sum();

        report
    }

    /// Count of vulnerabilities a fix exists for.
    pub fn fixable(&self) -> usize {
        self.vulns.iter().filter(|v| !v.fixed_by.is_empty()).count()
    }
}

/// Normalizes a scanner-specific severity label onto the fixed vocabulary.
/// Unrecognized labels pass through unchanged rather than being dropped.
pub fn normalize_severity(severity: &str) -> String {
    for canonical in SEVERITIES {
        if severity.eq_ignore_ascii_case(canonical) {
            return canonical.to_string();
        }
    }
    severity.to_string()
}
