//! # feedsync-search
//!
//! Publication of catalog changes to the search indexes.
//!
//! - **Index actions**: mutations for the `search` (per package id) and
//!   `hijack` (per version) logical indexes
//! - **Version lists**: per package id documents written back under the
//!   access condition they were read with
//! - **Batch pusher**: batches actions across both indexes and writes a
//!   package id's version list exactly once, after its last action landed
//! - **Catalog2Search**: reads commits after a cursor, builds actions, drives
//!   the pusher, then advances the cursor
//! - **Export**: concurrent indexing over disjoint key ranges
//! - **Backfill**: populates both indexes and the version lists from the whole
//!   catalog, then creates the publication cursor
//!
//! ## Storage Layout
//!
//! ```text
//! {state scope}/
//! ├── cursors/catalog2search.json     # publication cursor
//! └── version-lists/{id}.json         # one version list per package id
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use feedsync_search::{BatchPusher, BatchPusherConfig};
//!
//! let mut pusher = BatchPusher::new(search, hijack, version_lists, BatchPusherConfig::default());
//! pusher.enqueue(&package_id, actions)?;
//! pusher.push_full_batches().await?;
//! pusher.finish().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod batch_pusher;
pub mod builder;
pub mod catalog2search;
pub mod error;
pub mod export;
pub mod index;
pub mod metrics;
pub mod version_list;

// Re-export main types at crate root
pub use backfill::{BackfillSummary, CatalogExportSource, ExportSnapshot, backfill};
pub use batch_pusher::{BatchPusher, BatchPusherConfig, PushSummary};
pub use builder::{
    DefaultIndexActionBuilder, IndexActionBuilder, VersionChange, VersionChangeKind, hijack_key,
    search_key,
};
pub use catalog2search::{Catalog2Search, Catalog2SearchConfig, PassSummary, PublicationCursor};
pub use error::{Result, SearchError};
pub use export::{ExportConfig, ExportSource, ExportSummary, KeyRange, export, key_ranges};
pub use index::{
    IndexAction, IndexActionKind, IndexActions, IndexingResult, InMemorySearchIndex,
    LogicalIndex, SearchIndexClient, StorageSearchIndex,
};
pub use version_list::{
    AccessCondition, ResultAndAccessCondition, StorageVersionListClient, VersionListData,
    VersionListDataClient, VersionProperties,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch_pusher::{BatchPusher, BatchPusherConfig};
    pub use crate::builder::{IndexActionBuilder, VersionChange};
    pub use crate::catalog2search::{Catalog2Search, Catalog2SearchConfig};
    pub use crate::error::{Result, SearchError};
    pub use crate::index::{IndexAction, IndexActions, LogicalIndex, SearchIndexClient};
    pub use crate::version_list::{AccessCondition, VersionListDataClient};
}
