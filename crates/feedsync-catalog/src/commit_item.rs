//! Typed catalog commit items.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

use feedsync_core::PackageIdentity;

use crate::error::{CatalogError, Result};
use crate::manifest::{PageEntry, TypeTags};

/// Kinds of catalog items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CatalogItemType {
    /// Package metadata was created or edited.
    PackageDetails,
    /// A package was deleted.
    PackageDelete,
    /// The item is a stable, never-rewritten document.
    Permalink,
}

impl CatalogItemType {
    /// Returns the tag written to `@type`.
    #[must_use]
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::PackageDetails => "nuget:PackageDetails",
            Self::PackageDelete => "nuget:PackageDelete",
            Self::Permalink => "catalog:Permalink",
        }
    }

    /// Parses a `@type` tag.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::InvalidCommitItem` for unknown tags.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "nuget:PackageDetails" | "PackageDetails" => Ok(Self::PackageDetails),
            "nuget:PackageDelete" | "PackageDelete" => Ok(Self::PackageDelete),
            "catalog:Permalink" | "Permalink" => Ok(Self::Permalink),
            other => Err(CatalogError::InvalidCommitItem {
                message: format!("unknown item type '{other}'"),
            }),
        }
    }
}

impl fmt::Display for CatalogItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// One immutable event recorded in the catalog.
///
/// Items order by commit timestamp, then by identity, then by commit id, so
/// that items sharing a timestamp still have a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogCommitItem {
    location: String,
    commit_id: String,
    commit_timestamp: DateTime<Utc>,
    types: Vec<CatalogItemType>,
    identity: PackageIdentity,
}

impl CatalogCommitItem {
    /// Creates a commit item.
    ///
    /// Declared types are deduplicated and stored in a canonical order.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::InvalidCommitItem` if `types` is empty or the
    /// location or commit id is blank.
    pub fn new(
        location: impl Into<String>,
        commit_id: impl Into<String>,
        commit_timestamp: DateTime<Utc>,
        types: impl IntoIterator<Item = CatalogItemType>,
        identity: PackageIdentity,
    ) -> Result<Self> {
        let location = location.into();
        let commit_id = commit_id.into();
        let mut types: Vec<_> = types.into_iter().collect();
        types.sort_unstable();
        types.dedup();

        if types.is_empty() {
            return Err(CatalogError::InvalidCommitItem {
                message: format!("{identity} has no declared types"),
            });
        }
        if location.trim().is_empty() || commit_id.trim().is_empty() {
            return Err(CatalogError::InvalidCommitItem {
                message: format!("{identity} has a blank location or commit id"),
            });
        }

        Ok(Self {
            location,
            commit_id,
            commit_timestamp,
            types,
            identity,
        })
    }

    /// Parses a catalog page entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is invalid or any type tag is unknown
    /// or missing.
    pub fn from_page_entry(entry: &PageEntry) -> Result<Self> {
        let identity = PackageIdentity::new(&entry.package_id, &entry.package_version)?;
        let types = entry
            .types
            .iter()
            .map(CatalogItemType::from_tag)
            .collect::<Result<Vec<_>>>()?;

        Self::new(
            entry.location.clone(),
            entry.commit_id.clone(),
            entry.commit_timestamp,
            types,
            identity,
        )
    }

    /// Renders this item as a page entry.
    #[must_use]
    pub fn to_page_entry(&self) -> PageEntry {
        let types = match self.types.as_slice() {
            [single] => TypeTags::One(single.as_tag().to_string()),
            many => TypeTags::Many(many.iter().map(|t| t.as_tag().to_string()).collect()),
        };

        PageEntry {
            location: self.location.clone(),
            types,
            commit_id: self.commit_id.clone(),
            commit_timestamp: self.commit_timestamp,
            package_id: self.identity.id.as_str().to_string(),
            package_version: self.identity.version.as_str().to_string(),
        }
    }

    /// Location of the leaf document.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Id of the commit that added this item.
    #[must_use]
    pub fn commit_id(&self) -> &str {
        &self.commit_id
    }

    /// Timestamp of the commit that added this item.
    #[must_use]
    pub fn commit_timestamp(&self) -> DateTime<Utc> {
        self.commit_timestamp
    }

    /// Declared types, never empty.
    #[must_use]
    pub fn types(&self) -> &[CatalogItemType] {
        &self.types
    }

    /// Package identity.
    #[must_use]
    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    /// Returns true if the item declares `kind`.
    #[must_use]
    pub fn is(&self, kind: CatalogItemType) -> bool {
        self.types.contains(&kind)
    }

    /// Returns true if the item records a deletion.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.is(CatalogItemType::PackageDelete)
    }
}

impl PartialOrd for CatalogCommitItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CatalogCommitItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.commit_timestamp
            .cmp(&other.commit_timestamp)
            .then_with(|| self.identity.cmp(&other.identity))
            .then_with(|| self.commit_id.cmp(&other.commit_id))
            .then_with(|| self.location.cmp(&other.location))
            .then_with(|| self.types.cmp(&other.types))
    }
}
