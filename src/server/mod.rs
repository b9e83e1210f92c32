//! Reporting controller and HTTP surface
//!
//! The controller owns the registry client, the active scanner, and the
//! in-memory scan results; handlers and the background rescan task share it
//! behind an `Arc`. A full catalog traversal fans repositories out onto a
//! bounded worker pool and joins every task before publishing the aggregate
//! result; per-image scan failures are recorded as empty report entries and
//! never abort the batch.

use crate::error::{RegscanError, Result};
use crate::registry::Registry;
use crate::report::VulnerabilityReport;
use crate::scanner::Scanner;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tower_http::trace::TraceLayer;

/// Default cap on concurrent per-repository scans.
pub const DEFAULT_WORKERS: usize = 20;

/// One repository's slice of a catalog-wide scan.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryResult {
    pub name: String,
    pub uri: String,
    pub tags: Vec<String>,
    pub reports: Vec<VulnerabilityReport>,
}

/// The aggregate of a full catalog traversal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisResult {
    #[serde(rename = "registryDomain")]
    pub registry_domain: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
    pub repositories: Vec<RepositoryResult>,
}

/// Shared state for handlers and the background rescan task.
pub struct RegistryController {
    registry: Arc<Registry>,
    scanner: Option<Arc<dyn Scanner>>,
    interval: Duration,
    workers: usize,
    updating: AtomicBool,
    result: Mutex<AnalysisResult>,
}

impl RegistryController {
    pub fn new(
        registry: Registry,
        scanner: Option<Arc<dyn Scanner>>,
        interval: Duration,
        workers: usize,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            scanner,
            interval,
            workers: workers.max(1),
            updating: AtomicBool::new(false),
            result: Mutex::new(AnalysisResult::default()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scanner(&self) -> Option<&Arc<dyn Scanner>> {
        self.scanner.as_ref()
    }

    /// Runs one full catalog traversal and publishes the aggregate result.
    /// Returns `false` without scanning when a previous traversal is still
    /// in flight; overlapping runs are skipped, not queued.
    pub async fn scan_catalog(self: &Arc<Self>) -> Result<bool> {
        if self.updating.swap(true, Ordering::SeqCst) {
            tracing::info!("catalog scan already in progress, skipping");
            return Ok(false);
        }

        let outcome = self.scan_catalog_inner().await;
        self.updating.store(false, Ordering::SeqCst);
        outcome.map(|_| true)
    }

    async fn scan_catalog_inner(self: &Arc<Self>) -> Result<()> {
        tracing::info!(domain = self.registry.domain(), "fetching catalog");

        let repositories = self.registry.catalog().await.map_err(|e| {
            RegscanError::Network(format!(
                "getting catalog for {} failed: {}",
                self.registry.domain(),
                e
            ))
        })?;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let collected: Arc<Mutex<Vec<RepositoryResult>>> =
            Arc::new(Mutex::new(Vec::with_capacity(repositories.len())));

        let mut tasks = Vec::with_capacity(repositories.len());
        for repo in repositories {
            let controller = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let collected = Arc::clone(&collected);

            tasks.push(tokio::spawn(async move {
                // Semaphore is never closed while tasks run.
                let Ok(_permit) = semaphore.acquire().await else { return };
                let result = controller.scan_repository(&repo).await;
                collected.lock().await.push(result);
            }));
        }

        // Every per-repository task must finish before the aggregate is
        // published; there is no partial publish.
        join_all(tasks).await;

        let mut repositories: Vec<RepositoryResult> =
            collected.lock().await.drain(..).collect();
        repositories.sort_by(|a, b| a.name.cmp(&b.name));

        let mut result = self.result.lock().await;
        *result = AnalysisResult {
            registry_domain: self.registry.domain().to_string(),
            last_updated: chrono::Local::now().to_rfc2822(),
            repositories,
        };

        tracing::info!(
            domain = self.registry.domain(),
            repositories = result.repositories.len(),
            "catalog scan complete"
        );
        Ok(())
    }

    /// Scans every tag of one repository. Failures degrade to empty report
    /// entries so one broken image never sinks the traversal.
    async fn scan_repository(&self, repo: &str) -> RepositoryResult {
        let uri = format!("{}/{}", self.registry.domain(), repo);

        let tags = match self.registry.tags(repo).await {
            Ok(tags) => tags,
            Err(err) => {
                tracing::warn!(repo, %err, "listing tags failed");
                return RepositoryResult {
                    name: repo.to_string(),
                    uri,
                    tags: Vec::new(),
                    reports: Vec::new(),
                };
            }
        };

        let mut reports = Vec::new();
        if let Some(scanner) = &self.scanner {
            for tag in &tags {
                match scanner.scan_image(&self.registry, repo, tag).await {
                    Ok(report) => reports.push(report),
                    Err(err) => {
                        tracing::warn!(repo, tag, %err, "scanning image failed");
                        reports.push(VulnerabilityReport::new(
                            self.registry.domain(),
                            repo,
                            tag,
                        ));
                    }
                }
            }
        }

        RepositoryResult { name: repo.to_string(), uri, tags, reports }
    }

    /// The most recently published traversal result.
    pub async fn latest(&self) -> AnalysisResult {
        self.result.lock().await.clone()
    }

    /// Periodic rescan loop. Ticks firing mid-traversal are skipped by
    /// `scan_catalog` itself.
    pub async fn run_updater(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; the initial scan already ran.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            tracing::info!("interval rescan starting");
            if let Err(err) = self.scan_catalog().await {
                tracing::warn!(%err, "interval rescan failed");
            }
        }
    }

    /// Builds the HTTP router. Vulnerability routes are only mounted when a
    /// scanner is configured.
    pub fn router(self: Arc<Self>) -> Router {
        let mut router = Router::new()
            .route("/", get(index_handler))
            .route("/repo/{repo}/tags", get(tags_handler));

        if self.scanner.is_some() {
            router = router
                .route("/repo/{repo}/tag/{tag}/vulns", get(vulns_handler))
                .route("/repo/{repo}/tag/{tag}/vulns.json", get(vulns_handler));
        }

        router.layer(TraceLayer::new_for_http()).with_state(self)
    }

    /// Serves the reporting API on the given address.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| RegscanError::Network(format!("binding {} failed: {}", addr, e)))?;
        tracing::info!(addr, "starting server");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| RegscanError::Network(e.to_string()))
    }
}

type ControllerState = Arc<RegistryController>;

async fn index_handler(State(controller): State<ControllerState>) -> Response {
    Json(controller.latest().await).into_response()
}

async fn tags_handler(
    State(controller): State<ControllerState>,
    Path(repo): Path<String>,
) -> Response {
    match controller.registry().tags(&repo).await {
        Ok(tags) => Json(serde_json::json!({ "name": repo, "tags": tags })).into_response(),
        Err(RegscanError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, format!("no repository {}", repo)).into_response()
        }
        Err(err) => {
            tracing::error!(repo, %err, "listing tags failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "listing tags failed".to_string())
                .into_response()
        }
    }
}

async fn vulns_handler(
    State(controller): State<ControllerState>,
    Path((repo, tag)): Path<(String, String)>,
) -> Response {
    if repo.is_empty() || tag.is_empty() {
        return (StatusCode::NOT_FOUND, "repo and tag are required").into_response();
    }

    // Router only mounts this handler when a scanner exists.
    let Some(scanner) = controller.scanner() else {
        return (StatusCode::NOT_FOUND, "no scanner configured").into_response();
    };

    match scanner.scan_image(controller.registry(), &repo, &tag).await {
        Ok(report) => Json(report).into_response(),
        Err(RegscanError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, format!("no image {}:{}", repo, tag)).into_response()
        }
        Err(err) => {
            tracing::error!(repo, tag, %err, "scan failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "scan failed".to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOptions;
    use crate::report::Vulnerability;
    use async_trait::async_trait;

    struct StaticScanner;

    #[async_trait]
    impl Scanner for StaticScanner {
        async fn scan_image(
            &self,
            registry: &Registry,
            repo: &str,
            tag: &str,
        ) -> Result<VulnerabilityReport> {
            Ok(VulnerabilityReport::from_vulns(
                registry.domain(),
                repo,
                tag,
                "",
                vec![Vulnerability {
                    name: "CVE-1".to_string(),
                    severity: "High".to_string(),
                    ..Default::default()
                }],
            ))
        }

        fn kind(&self) -> &'static str {
            "static"
        }
    }

    async fn test_controller() -> Arc<RegistryController> {
        let registry = Registry::builder("localhost:5000")
            .with_options(RegistryOptions {
                skip_ping: true,
                non_ssl: true,
                ..Default::default()
            })
            .build()
            .await
            .unwrap();
        Arc::new(RegistryController::new(
            registry,
            Some(Arc::new(StaticScanner)),
            Duration::from_secs(3600),
            DEFAULT_WORKERS,
        ))
    }

    #[tokio::test]
    async fn test_overlapping_scan_is_skipped() {
        let controller = test_controller().await;
        controller.updating.store(true, Ordering::SeqCst);
        // A tick firing mid-traversal is skipped, never queued.
        assert!(!controller.scan_catalog().await.unwrap());
        controller.updating.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_latest_starts_empty() {
        let controller = test_controller().await;
        let result = controller.latest().await;
        assert!(result.repositories.is_empty());
        assert!(result.registry_domain.is_empty());
    }

    #[tokio::test]
    async fn test_router_mounts_vuln_routes_only_with_scanner() {
        let with_scanner = test_controller().await;
        let _ = with_scanner.router();

        let registry = Registry::builder("localhost:5000")
            .with_options(RegistryOptions {
                skip_ping: true,
                non_ssl: true,
                ..Default::default()
            })
            .build()
            .await
            .unwrap();
        let without = Arc::new(RegistryController::new(
            registry,
            None,
            Duration::from_secs(3600),
            DEFAULT_WORKERS,
        ));
        let _ = without.router();
    }
}
