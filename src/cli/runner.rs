//! Command dispatch and execution

use super::args::{Args, Command};
use crate::error::{RegscanError, Result};
use crate::reference::ImageReference;
use crate::registry::{Registry, RegistryOptions};
use crate::report::{VulnerabilityReport, SEVERITIES};
use crate::scanner::{Scanner, ScannerConfig};
use crate::server::RegistryController;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Number of bad vulnerabilities tolerated before the vulns command exits
/// fatally.
const BAD_VULNS_LIMIT: usize = 10;

pub async fn run(args: Args) -> Result<()> {
    match &args.command {
        Command::List { domain } => list(&args, domain).await,
        Command::Tags { image } => tags(&args, image).await,
        Command::Manifest { v1, image } => manifest(&args, *v1, image).await,
        Command::Digest { image } => digest(&args, image).await,
        Command::Delete { image } => delete(&args, image).await,
        Command::Layer { output, image } => layer(&args, output.as_deref(), image).await,
        Command::Vulns { clair, fixable_threshold, image } => {
            vulns(&args, clair, *fixable_threshold, image).await
        }
        Command::Server {
            registry,
            clair,
            trivy,
            interval,
            workers,
            listen_address,
            port,
            once,
        } => {
            server(
                &args,
                registry,
                clair.as_deref(),
                trivy.as_deref(),
                *interval,
                *workers,
                listen_address,
                *port,
                *once,
            )
            .await
        }
    }
}

/// Builds a registry client from the global flags.
async fn create_registry(args: &Args, domain: &str) -> Result<Registry> {
    let opt = RegistryOptions {
        insecure: args.insecure,
        non_ssl: args.force_non_ssl,
        skip_ping: args.skip_ping,
        timeout: Duration::from_secs(args.timeout),
        headers: HashMap::new(),
    };

    Registry::builder(domain)
        .with_auth(
            args.username.clone().unwrap_or_default(),
            args.password.clone().unwrap_or_default(),
        )
        .with_options(opt)
        .build()
        .await
}

async fn list(args: &Args, domain: &str) -> Result<()> {
    let registry = create_registry(args, domain).await?;

    let mut repos = registry.catalog().await?;
    repos.sort();

    println!("Repositories for {}", registry.domain());

    // Tag listings are independent; fan them out and collect under a lock.
    let registry = Arc::new(registry);
    let repo_tags: Arc<Mutex<HashMap<String, Vec<String>>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut tasks = Vec::with_capacity(repos.len());
    for repo in repos.clone() {
        let registry = Arc::clone(&registry);
        let repo_tags = Arc::clone(&repo_tags);
        tasks.push(tokio::spawn(async move {
            match registry.tags(&repo).await {
                Ok(mut tags) => {
                    tags.sort();
                    repo_tags.lock().await.insert(repo, tags);
                }
                Err(err) => eprintln!("getting tags for {} failed: {}", repo, err),
            }
        }));
    }
    futures::future::join_all(tasks).await;

    let repo_tags = repo_tags.lock().await;
    println!("{:<40} TAGS", "REPO");
    for repo in &repos {
        let tags = repo_tags.get(repo).map(|t| t.join(", ")).unwrap_or_default();
        println!("{:<40} {}", repo, tags);
    }

    Ok(())
}

async fn tags(args: &Args, image: &str) -> Result<()> {
    let image = ImageReference::parse(image)?;
    let registry = create_registry(args, &image.domain).await?;

    let mut tags = registry.tags(&image.path).await?;
    tags.sort();

    for tag in tags {
        println!("{}", tag);
    }

    Ok(())
}

async fn manifest(args: &Args, v1: bool, image: &str) -> Result<()> {
    let image = ImageReference::parse(image)?;
    let registry = create_registry(args, &image.domain).await?;

    let rendered = if v1 {
        let manifest = registry.manifest_v1(&image.path, image.reference()).await?;
        serde_json::to_string_pretty(&manifest)?
    } else {
        match registry.manifest(&image.path, image.reference()).await? {
            crate::registry::manifest::Manifest::V1(m) => serde_json::to_string_pretty(&m)?,
            crate::registry::manifest::Manifest::V2(m) => serde_json::to_string_pretty(&m)?,
            crate::registry::manifest::Manifest::List(m) => serde_json::to_string_pretty(&m)?,
        }
    };

    println!("{}", rendered);
    Ok(())
}

async fn digest(args: &Args, image: &str) -> Result<()> {
    let image = ImageReference::parse(image)?;
    let registry = create_registry(args, &image.domain).await?;

    let digest = registry.digest(&image, &[]).await?;
    println!("{}", digest);
    Ok(())
}

async fn delete(args: &Args, image: &str) -> Result<()> {
    let image = ImageReference::parse(image)?;
    let registry = create_registry(args, &image.domain).await?;

    registry.delete(&image.path, image.reference()).await?;
    println!("Deleted {}", image);
    Ok(())
}

async fn layer(args: &Args, output: Option<&std::path::Path>, image: &str) -> Result<()> {
    let image = ImageReference::parse(image)?;
    let digest = image.digest.clone().ok_or_else(|| {
        RegscanError::Validation("pass the image with its digest, NAME@DIGEST".to_string())
    })?;

    let registry = create_registry(args, &image.domain).await?;
    let blob = registry.download_layer(&image.path, &digest).await?;

    match output {
        Some(path) => tokio::fs::write(path, blob).await?,
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&blob)?;
        }
    }

    Ok(())
}

async fn vulns(args: &Args, clair: &str, fixable_threshold: usize, image: &str) -> Result<()> {
    if clair.is_empty() {
        return Err(RegscanError::Validation("clair url cannot be empty, pass --clair".to_string()));
    }

    let image = ImageReference::parse(image)?;
    let registry = create_registry(args, &image.domain).await?;

    let scanner = crate::scanner::clair::Clair::new(
        clair.to_string(),
        args.insecure,
        Duration::from_secs(args.timeout),
    )?;

    let tag = image.tag.clone().unwrap_or_else(|| "latest".to_string());
    let report = scanner.scan_image(&registry, &image.path, &tag).await?;

    print_report(&report);

    let fixable = report.fixable();
    if fixable > fixable_threshold {
        return Err(RegscanError::ThresholdExceeded(format!(
            "{} fixable vulnerabilities found",
            fixable
        )));
    }

    if report.bad_vulns > BAD_VULNS_LIMIT {
        return Err(RegscanError::ThresholdExceeded(format!(
            "{} bad vulnerabilities found",
            report.bad_vulns
        )));
    }

    Ok(())
}

fn print_report(report: &VulnerabilityReport) {
    // Known severities in ascending order first, ad hoc buckets after.
    let mut order: Vec<&str> = SEVERITIES.to_vec();
    for sev in report.vulns_by_severity.keys() {
        if !order.contains(&sev.as_str()) {
            order.push(sev);
        }
    }

    for sev in &order {
        let Some(vulns) = report.vulns_by_severity.get(*sev) else { continue };
        for v in vulns {
            println!("{}: [{}] \n{}\n{}", v.name, v.severity, v.description, v.link);
            if !v.fixed_by.is_empty() {
                println!("Fixed by: {}", v.fixed_by);
            }
            println!("-----------------------------------------");
        }
    }

    for sev in &order {
        if let Some(vulns) = report.vulns_by_severity.get(*sev) {
            println!("{}: {}", sev, vulns.len());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn server(
    args: &Args,
    registry_domain: &str,
    clair: Option<&str>,
    trivy: Option<&str>,
    interval: u64,
    workers: usize,
    listen_address: &str,
    port: u16,
    once: bool,
) -> Result<()> {
    let registry = create_registry(args, registry_domain).await?;

    let scanner = ScannerConfig {
        clair_url: clair.map(|s| s.to_string()),
        trivy_location: trivy.map(|s| s.to_string()),
        insecure: args.insecure,
        timeout: Duration::from_secs(args.timeout),
    }
    .build()?;

    if let Some(scanner) = &scanner {
        tracing::info!(kind = scanner.kind(), "scanner configured");
    }

    let controller = Arc::new(RegistryController::new(
        registry,
        scanner,
        Duration::from_secs(interval),
        workers,
    ));

    tracing::info!("running initial catalog scan");
    controller.scan_catalog().await?;

    if once {
        println!("{}", serde_json::to_string_pretty(&controller.latest().await)?);
        return Ok(());
    }

    tokio::spawn(Arc::clone(&controller).run_updater());

    let addr = format!("{}:{}", listen_address, port);
    controller.serve(&addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Vulnerability;

    #[test]
    fn test_bad_vulns_limit_gate() {
        let raw: Vec<_> = (0..11)
            .map(|i| Vulnerability {
                name: format!("CVE-{}", i),
                severity: "High".to_string(),
                ..Default::default()
            })
            .collect();
        let report = VulnerabilityReport::from_vulns("r", "repo", "tag", "", raw);
        assert!(report.bad_vulns > BAD_VULNS_LIMIT);
    }

    #[test]
    fn test_print_report_handles_adhoc_buckets() {
        let report = VulnerabilityReport::from_vulns(
            "r",
            "repo",
            "tag",
            "",
            vec![Vulnerability {
                name: "CVE-1".to_string(),
                severity: "EXOTIC".to_string(),
                ..Default::default()
            }],
        );
        // Must not panic on severities outside the fixed vocabulary.
        print_report(&report);
    }
}
