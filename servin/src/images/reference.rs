//! Image reference parsing.
//!
//! Grammar: `<name>(:<tag>)?` where `name` is lowercase alphanumerics plus
//! `.`, `_`, `-` and `/` path separators, optionally prefixed by a registry
//! `host[:port]/`. A missing tag defaults to `latest`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};

/// Parsed `name:tag` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse a reference string, applying the `latest` default.
    pub fn parse(reference: &str) -> ServinResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ServinError::InvalidConfig("empty image reference".into()));
        }

        // The tag separator is a ':' after the last '/', so a registry port
        // (`host:5000/name`) is not mistaken for a tag.
        let last_slash = reference.rfind('/');
        let tag_colon = match reference.rfind(':') {
            Some(idx) if last_slash.is_none_or(|s| idx > s) => Some(idx),
            _ => None,
        };

        let (name, tag) = match tag_colon {
            Some(idx) => (&reference[..idx], &reference[idx + 1..]),
            None => (reference, "latest"),
        };

        if name.is_empty() || tag.is_empty() {
            return Err(ServinError::InvalidConfig(format!(
                "invalid image reference: {reference}"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || ".:_-/".contains(c))
        {
            return Err(ServinError::InvalidConfig(format!(
                "invalid image name: {name}"
            )));
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        {
            return Err(ServinError::InvalidConfig(format!("invalid tag: {tag}")));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Normalized `name:tag` string used as the tag-index key.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_latest() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.canonical(), "alpine:latest");
    }

    #[test]
    fn test_explicit_tag() {
        let r = ImageReference::parse("alpine:3.18").unwrap();
        assert_eq!(r.name, "alpine");
        assert_eq!(r.tag, "3.18");
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let r = ImageReference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.name, "localhost:5000/team/app");
        assert_eq!(r.tag, "latest");

        let r = ImageReference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(r.name, "localhost:5000/team/app");
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Alpine").is_err());
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("alpine:a b").is_err());
    }
}
