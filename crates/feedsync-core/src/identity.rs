//! Package identity primitives.
//!
//! A [`PackageIdentity`] is the `(package id, version)` pair that addresses one
//! release. Package ids compare case-insensitively. Versions are normalized on
//! construction (`1.0` becomes `1.0.0`, `01.2.3.0` becomes `1.2.3`, build
//! metadata is dropped) and also compare case-insensitively.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A package id. Equality, hashing, and ordering ignore ASCII case.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    original: String,
    lower: String,
}

impl PackageId {
    /// Creates a package id.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if the id is empty or contains
    /// whitespace or path separators.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let original = id.into().trim().to_string();
        if original.is_empty() {
            return Err(Error::invalid_identity("package id cannot be empty"));
        }
        if original
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(Error::invalid_identity(format!(
                "package id '{original}' contains whitespace or path separators"
            )));
        }
        let lower = original.to_ascii_lowercase();
        Ok(Self { original, lower })
    }

    /// Returns the id as originally observed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Returns the lower-cased comparison key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.lower
    }
}

impl PartialEq for PackageId {
    fn eq(&self, other: &Self) -> bool {
        self.lower == other.lower
    }
}

impl Eq for PackageId {}

impl Hash for PackageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lower.hash(state);
    }
}

impl PartialOrd for PackageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lower.cmp(&other.lower)
    }
}

impl fmt::Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageId({})", self.original)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl TryFrom<String> for PackageId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PackageId> for String {
    fn from(value: PackageId) -> Self {
        value.original
    }
}

/// A normalized package version.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedVersion {
    normalized: String,
    lower: String,
    release: [u64; 4],
    label: Option<String>,
}

impl NormalizedVersion {
    /// Parses and normalizes a version string.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if the version is not of the form
    /// `major[.minor[.patch[.revision]]][-label][+metadata]`.
    pub fn parse(version: &str) -> Result<Self> {
        let trimmed = version.trim();
        let without_metadata = trimmed.split_once('+').map_or(trimmed, |(v, _)| v);
        let (release_part, label) = match without_metadata.split_once('-') {
            Some((release, label)) => (release, Some(label)),
            None => (without_metadata, None),
        };

        let invalid = || Error::invalid_identity(format!("invalid version '{version}'"));

        let parts: Vec<&str> = release_part.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid());
        }

        let mut release = [0u64; 4];
        for (slot, part) in release.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        let label = match label {
            Some(label) => {
                let valid = !label.is_empty()
                    && label.split('.').all(|segment| {
                        !segment.is_empty()
                            && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    });
                if !valid {
                    return Err(invalid());
                }
                Some(label.to_string())
            }
            None => None,
        };

        let mut normalized = format!("{}.{}.{}", release[0], release[1], release[2]);
        if release[3] != 0 {
            normalized.push_str(&format!(".{}", release[3]));
        }
        if let Some(label) = &label {
            normalized.push('-');
            normalized.push_str(label);
        }
        let lower = normalized.to_ascii_lowercase();

        Ok(Self {
            normalized,
            lower,
            release,
            label,
        })
    }

    /// Returns the normalized version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Returns the lower-cased comparison key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.lower
    }

    /// Returns true if the version carries a prerelease label.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.label.is_some()
    }
}

fn compare_labels(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase()),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

impl PartialEq for NormalizedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.lower == other.lower
    }
}

impl Eq for NormalizedVersion {}

impl Hash for NormalizedVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lower.hash(state);
    }
}

impl PartialOrd for NormalizedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NormalizedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release
            .cmp(&other.release)
            .then_with(|| match (&self.label, &other.label) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_labels(a, b),
            })
            // Keeps Ord consistent with Eq for labels that differ only in
            // numeric formatting ("rc.01" vs "rc.1").
            .then_with(|| self.lower.cmp(&other.lower))
    }
}

impl fmt::Debug for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NormalizedVersion({})", self.normalized)
    }
}

impl fmt::Display for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl TryFrom<String> for NormalizedVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NormalizedVersion> for String {
    fn from(value: NormalizedVersion) -> Self {
        value.normalized
    }
}

/// The `(package id, version)` pair that uniquely addresses a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIdentity {
    /// Package id.
    pub id: PackageId,
    /// Normalized version.
    pub version: NormalizedVersion,
}

impl PackageIdentity {
    /// Creates an identity from raw id and version strings.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if either component is invalid.
    pub fn new(id: &str, version: &str) -> Result<Self> {
        Ok(Self {
            id: PackageId::new(id)?,
            version: NormalizedVersion::parse(version)?,
        })
    }

    /// Returns a lower-cased `id|version` key, unique per identity.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}|{}", self.id.key(), self.version.key())
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.version)
    }
}
