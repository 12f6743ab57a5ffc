//! Catalog root and page documents.
//!
//! Layout under the catalog scope:
//!
//! ```text
//! index.json                                   # root, the only mutable object
//! pages/page{n}/{commitId}.json                # immutable page versions
//! data/{yyyy.MM.dd.HH.mm.ss.fffffffff}/{id}.{version}.json   # immutable leaves
//! ```
//!
//! Every commit writes its leaves and new page versions first, then swaps the
//! root with a compare-and-swap. Readers only follow references from the root,
//! so objects written by a commit that lost its CAS are never observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use feedsync_core::PackageIdentity;

use crate::watermark::Watermark;

/// Current catalog root format version.
pub const ROOT_FORMAT_VERSION: u32 = 1;

/// Well-known paths within the catalog scope.
pub mod paths {
    use chrono::{DateTime, Utc};

    use feedsync_core::PackageIdentity;

    /// Catalog root document.
    pub const ROOT: &str = "index.json";

    /// Path of one immutable version of page `number`.
    #[must_use]
    pub fn page(number: usize, commit_id: &str) -> String {
        format!("pages/page{number}/{commit_id}.json")
    }

    /// Path of the leaf document for `identity` written by the commit at
    /// `commit_timestamp`.
    #[must_use]
    pub fn leaf(commit_timestamp: DateTime<Utc>, identity: &PackageIdentity) -> String {
        format!(
            "data/{}/{}.{}.json",
            commit_timestamp.format("%Y.%m.%d.%H.%M.%S%.9f"),
            identity.id.key(),
            identity.version.key()
        )
    }
}

/// The catalog root (`index.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRoot {
    /// Format version.
    pub version: u32,
    /// Id of the most recent commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    /// Timestamp of the most recent commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// Total number of committed items.
    pub count: u64,
    /// Watermark persisted by the most recent commit.
    #[serde(default)]
    pub watermark: Watermark,
    /// Page references in append order.
    #[serde(default)]
    pub pages: Vec<PageRef>,
}

impl CatalogRoot {
    /// Creates the root of an empty catalog.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: ROOT_FORMAT_VERSION,
            commit_id: None,
            commit_timestamp: None,
            count: 0,
            watermark: Watermark::default(),
            pages: Vec::new(),
        }
    }
}

/// Reference from the root to the current version of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRef {
    /// Path of the page version.
    pub path: String,
    /// Number of items on the page.
    pub count: usize,
    /// Id of the commit that wrote this page version.
    pub commit_id: String,
    /// Latest commit timestamp of any item on the page.
    pub commit_timestamp: DateTime<Utc>,
}

/// One page document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    /// Id of the commit that wrote this page version.
    pub commit_id: String,
    /// Timestamp of the commit that wrote this page version.
    pub commit_timestamp: DateTime<Utc>,
    /// Entries in commit order.
    pub items: Vec<PageEntry>,
}

/// Type tags on a page entry: a single tag or a list of tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeTags {
    /// A single tag.
    One(String),
    /// Several tags.
    Many(Vec<String>),
}

impl TypeTags {
    /// Iterates the tags.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let tags: &[String] = match self {
            Self::One(tag) => std::slice::from_ref(tag),
            Self::Many(tags) => tags,
        };
        tags.iter().map(String::as_str)
    }
}

/// One item reference on a catalog page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    /// Location of the leaf document.
    #[serde(rename = "@id")]
    pub location: String,
    /// Declared type tags.
    #[serde(rename = "@type")]
    pub types: TypeTags,
    /// Commit that added the item.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Timestamp of that commit.
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Package id.
    #[serde(rename = "nuget:id")]
    pub package_id: String,
    /// Normalized package version.
    #[serde(rename = "nuget:version")]
    pub package_version: String,
}

impl PageEntry {
    /// Returns true if this entry belongs to `identity`.
    #[must_use]
    pub fn is_for(&self, identity: &PackageIdentity) -> bool {
        self.package_id.eq_ignore_ascii_case(identity.id.as_str())
            && self
                .package_version
                .eq_ignore_ascii_case(identity.version.as_str())
    }
}
