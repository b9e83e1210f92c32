//! regscan library
//!
//! Client for Docker Registry v2 / OCI Distribution registries with
//! vulnerability scanning through Clair-compatible services or
//! Trivy-compatible subprocess scanners, plus a thin reporting server.

pub mod cli;
pub mod digest;
pub mod error;
pub mod reference;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod server;

pub use error::{RegscanError, Result};
pub use reference::ImageReference;
pub use registry::{Registry, RegistryBuilder, RegistryOptions};
pub use report::{Vulnerability, VulnerabilityReport};
pub use scanner::{Scanner, ScannerConfig};
