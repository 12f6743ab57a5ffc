//! # feedsync-catalog
//!
//! Append-only package catalog fed from a package gallery.
//!
//! - **Feed delta**: packages created or edited after a watermark, and
//!   deletions from the audit trail, grouped by change timestamp
//! - **Delete segmentation**: splits deletions so that no commit repeats an
//!   identity
//! - **Catalog writer**: immutable leaves and page versions, published by a CAS
//!   on the root document together with the watermark
//! - **Catalog reader**: commit items after a cursor, in commit order
//! - **Feed2Catalog**: the deletes / creates / edits cycle
//!
//! ## Storage Layout
//!
//! ```text
//! {catalog scope}/
//! ├── index.json                        # root: watermark, page refs, commit info
//! ├── pages/page{n}/{commit_id}.json    # immutable page versions
//! └── data/{timestamp}/{id}.{version}.json  # immutable leaves
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use feedsync_catalog::{Feed2Catalog, SyncConfig};
//!
//! let mut job = Feed2Catalog::new(catalog, feed, audit, SyncConfig::default());
//! let counts = job.run(&cancel).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod commit_item;
pub mod delta;
pub mod error;
pub mod feed_http;
pub mod item_creator;
pub mod manifest;
pub mod metrics;
pub mod reader;
pub mod segment;
pub mod sync;
pub mod watermark;
pub mod writer;

// Re-export main types at crate root
pub use audit::StorageAuditSource;
pub use commit_item::{CatalogCommitItem, CatalogItemType};
pub use delta::{
    ChangeKind, DeletionAuditEntry, DeletionAuditSource, Delta, DeltaFetcher, FeedClient,
    FeedPackageDetails,
};
pub use error::{CatalogError, Result};
pub use feed_http::HttpFeedClient;
pub use item_creator::{CatalogItemCreator, FeedMetadataItemCreator};
pub use manifest::{CatalogPage, CatalogRoot, PageEntry, PageRef};
pub use reader::{CatalogReader, CatalogSnapshot};
pub use segment::{DeleteSegment, segment_deletes};
pub use sync::{Feed2Catalog, IterationCounts, SyncConfig};
pub use watermark::{ResolvedWatermark, Watermark};
pub use writer::{AppendOnlyCatalogWriter, CatalogItem, CommitRecord};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::commit_item::{CatalogCommitItem, CatalogItemType};
    pub use crate::delta::{ChangeKind, DeletionAuditSource, FeedClient, FeedPackageDetails};
    pub use crate::error::{CatalogError, Result};
    pub use crate::reader::CatalogReader;
    pub use crate::sync::{Feed2Catalog, SyncConfig};
    pub use crate::watermark::Watermark;
    pub use crate::writer::{AppendOnlyCatalogWriter, CatalogItem};
}
