//! Image reference parsing
//!
//! An image reference is `[domain/]path[:tag|@digest]`. Exactly one of tag or
//! digest is set after parsing; the tag defaults to `latest` when neither is
//! given. References are immutable once parsed.

use crate::error::{RegscanError, Result};
use std::fmt;

/// Default registry domain used when a reference carries none.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Default tag used when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses an image reference of the form `[domain/]path[:tag|@digest]`.
    ///
    /// A leading component counts as a domain only if it contains a `.` or a
    /// `:` or is exactly `localhost`. Single-component paths on the default
    /// domain are normalized under `library/`.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(RegscanError::Validation("image reference is empty".to_string()));
        }

        // Digest first: a digest contains a colon, so it must be split off
        // before any tag detection.
        let (remainder, digest) = match input.split_once('@') {
            Some((rest, d)) => {
                if d.is_empty() {
                    return Err(RegscanError::Validation(format!("invalid digest in reference: {}", input)));
                }
                (rest, Some(d.to_string()))
            }
            None => (input, None),
        };

        let (remainder, tag) = if digest.is_none() {
            // Only a colon after the last slash is a tag separator; a colon
            // before it belongs to the domain's port.
            match remainder.rfind(':') {
                Some(idx) if remainder[idx..].find('/').is_none() => {
                    let t = &remainder[idx + 1..];
                    if t.is_empty() {
                        return Err(RegscanError::Validation(format!("invalid tag in reference: {}", input)));
                    }
                    (&remainder[..idx], Some(t.to_string()))
                }
                _ => (remainder, None),
            }
        } else {
            (remainder, None)
        };

        let (domain, mut path) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), remainder.to_string()),
        };

        if path.is_empty() {
            return Err(RegscanError::Validation(format!("invalid repository path in reference: {}", input)));
        }

        if domain == DEFAULT_DOMAIN && !path.contains('/') {
            path = format!("library/{}", path);
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference { domain, path, tag, digest })
    }

    /// The reference to use against the manifests endpoint: the digest when
    /// set, the tag otherwise.
    pub fn reference(&self) -> &str {
        match &self.digest {
            Some(d) => d,
            None => self.tag.as_deref().unwrap_or(DEFAULT_TAG),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(d) => write!(f, "{}/{}@{}", self.domain, self.path, d),
            None => write!(f, "{}/{}:{}", self.domain, self.path, self.reference()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_name() {
        let img = ImageReference::parse("alpine").unwrap();
        assert_eq!(img.domain, "docker.io");
        assert_eq!(img.path, "library/alpine");
        assert_eq!(img.tag.as_deref(), Some("latest"));
        assert!(img.digest.is_none());
    }

    #[test]
    fn test_parse_with_tag() {
        let img = ImageReference::parse("r.j3ss.co/htop:v1.0").unwrap();
        assert_eq!(img.domain, "r.j3ss.co");
        assert_eq!(img.path, "htop");
        assert_eq!(img.tag.as_deref(), Some("v1.0"));
        assert_eq!(img.reference(), "v1.0");
    }

    #[test]
    fn test_parse_with_digest() {
        let img = ImageReference::parse(
            "registry.example.com/foo/bar@sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        assert_eq!(img.domain, "registry.example.com");
        assert_eq!(img.path, "foo/bar");
        assert!(img.tag.is_none());
        assert!(img.reference().starts_with("sha256:"));
    }

    #[test]
    fn test_parse_with_port() {
        let img = ImageReference::parse("localhost:5000/myrepo:dev").unwrap();
        assert_eq!(img.domain, "localhost:5000");
        assert_eq!(img.path, "myrepo");
        assert_eq!(img.tag.as_deref(), Some("dev"));
    }

    #[test]
    fn test_parse_nested_path_no_domain() {
        let img = ImageReference::parse("jess/htop").unwrap();
        assert_eq!(img.domain, "docker.io");
        assert_eq!(img.path, "jess/htop");
    }

    #[test]
    fn test_exactly_one_of_tag_or_digest() {
        let tagged = ImageReference::parse("alpine:3.19").unwrap();
        assert!(tagged.tag.is_some() && tagged.digest.is_none());

        let digested = ImageReference::parse(
            "alpine@sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        assert!(digested.tag.is_none() && digested.digest.is_some());
    }

    #[test]
    fn test_display_round_trip() {
        let img = ImageReference::parse("r.j3ss.co/htop:v1.0").unwrap();
        assert_eq!(img.to_string(), "r.j3ss.co/htop:v1.0");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("foo:").is_err());
        assert!(ImageReference::parse("foo@").is_err());
    }
}
