//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "regscan")]
#[command(about = "Client and reporting server for Docker Registry v2 / OCI registries")]
#[command(version)]
pub struct Args {
    /// Username for registry authentication
    #[arg(long, short = 'u', global = true)]
    pub username: Option<String>,

    /// Password for registry authentication
    #[arg(long, short = 'p', global = true)]
    pub password: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Use http:// for scheme-less registry domains
    #[arg(long, global = true)]
    pub force_non_ssl: bool,

    /// Skip the registry ping on client creation
    #[arg(long, global = true)]
    pub skip_ping: bool,

    /// Timeout for registry requests, in seconds
    #[arg(long, short = 't', global = true, default_value = "60")]
    pub timeout: u64,

    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List all repositories in a registry
    #[command(alias = "ls")]
    List {
        /// Registry domain (ex. r.j3ss.co)
        domain: String,
    },

    /// List the tags for a repository
    Tags {
        /// Image or repository name
        image: String,
    },

    /// Get the manifest for an image
    Manifest {
        /// Fetch the schema 1 manifest
        #[arg(long)]
        v1: bool,
        /// Image name, NAME[:TAG|@DIGEST]
        image: String,
    },

    /// Get the content digest for an image
    Digest {
        /// Image name, NAME[:TAG|@DIGEST]
        image: String,
    },

    /// Delete an image reference from a registry
    #[command(alias = "rm")]
    Delete {
        /// Image name, NAME[:TAG|@DIGEST]
        image: String,
    },

    /// Download a layer blob
    #[command(name = "layer", alias = "download")]
    Layer {
        /// Write the blob to a file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Image name with digest, NAME@DIGEST
        image: String,
    },

    /// Get a vulnerability report for an image
    Vulns {
        /// URL of a Clair-compatible scanner instance
        #[arg(long)]
        clair: String,
        /// Number of fixable issues permitted
        #[arg(long, default_value = "0")]
        fixable_threshold: usize,
        /// Image name, NAME[:TAG]
        image: String,
    },

    /// Run the vulnerability reporting server
    Server {
        /// URL to the registry (ex. r.j3ss.co)
        #[arg(long, short = 'r')]
        registry: String,
        /// URL of a Clair-compatible scanner instance
        #[arg(long)]
        clair: Option<String>,
        /// Path to a Trivy-compatible scanner binary
        #[arg(long)]
        trivy: Option<String>,
        /// Interval between catalog rescans, in seconds
        #[arg(long, default_value = "3600")]
        interval: u64,
        /// Maximum concurrent per-repository scans
        #[arg(long, default_value = "20")]
        workers: usize,
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen_address: String,
        /// Port for the server to run on
        #[arg(long, default_value = "8080")]
        port: u16,
        /// Run a single catalog scan and exit
        #[arg(long)]
        once: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_alias() {
        let args = Args::parse_from(["regscan", "ls", "r.j3ss.co"]);
        assert!(matches!(args.command, Command::List { .. }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["regscan", "tags", "alpine", "-u", "me", "-p", "secret", "-k"]);
        assert_eq!(args.username.as_deref(), Some("me"));
        assert!(args.insecure);
    }

    #[test]
    fn test_vulns_requires_clair() {
        assert!(Args::try_parse_from(["regscan", "vulns", "alpine"]).is_err());
        let args =
            Args::parse_from(["regscan", "vulns", "--clair", "http://clair:6060", "alpine"]);
        match args.command {
            Command::Vulns { clair, fixable_threshold, image } => {
                assert_eq!(clair, "http://clair:6060");
                assert_eq!(fixable_threshold, 0);
                assert_eq!(image, "alpine");
            }
            _ => panic!("expected vulns command"),
        }
    }

    #[test]
    fn test_layer_output_flag() {
        let args = Args::parse_from(["regscan", "download", "-o", "layer.tar", "alpine@sha256:abc"]);
        match args.command {
            Command::Layer { output, .. } => {
                assert_eq!(output.unwrap().to_str().unwrap(), "layer.tar")
            }
            _ => panic!("expected layer command"),
        }
    }
}
