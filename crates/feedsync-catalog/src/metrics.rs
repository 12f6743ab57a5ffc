//! Catalog metrics.
//!
//! Counters and histograms for the feed-to-catalog pipeline. These complement
//! the structured logs emitted by the writer and the synchronization cycle.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Commit Metrics
// ============================================================================

/// Catalog commits counter.
pub const CATALOG_COMMITS: &str = "feedsync_catalog_commits_total";

/// Items committed to the catalog.
pub const CATALOG_ITEMS: &str = "feedsync_catalog_items_total";

/// Commit duration histogram.
pub const COMMIT_DURATION: &str = "feedsync_catalog_commit_duration_seconds";

/// CAS conflicts on the catalog root.
pub const CAS_CONFLICTS: &str = "feedsync_catalog_cas_conflicts_total";

// ============================================================================
// Sync Metrics
// ============================================================================

/// Packages processed by the synchronization cycle, labelled by change kind.
pub const PACKAGES_PROCESSED: &str = "feedsync_packages_processed_total";

/// Feed or audit fetch failures.
pub const FETCH_ERRORS: &str = "feedsync_fetch_errors_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all catalog metric descriptions.
///
/// Call this once at application startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(CATALOG_COMMITS, "Total catalog commits published");
    describe_counter!(CATALOG_ITEMS, "Total items appended to the catalog");
    describe_histogram!(COMMIT_DURATION, "Duration of catalog commits in seconds");
    describe_counter!(CAS_CONFLICTS, "Total catalog root CAS conflicts");
    describe_counter!(
        PACKAGES_PROCESSED,
        "Total packages processed by the sync cycle"
    );
    describe_counter!(FETCH_ERRORS, "Total feed and audit fetch failures");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records a successful commit.
pub fn record_commit(items: usize, duration_secs: f64) {
    counter!(CATALOG_COMMITS).increment(1);
    counter!(CATALOG_ITEMS).increment(items as u64);
    histogram!(COMMIT_DURATION).record(duration_secs);
}

/// Records a lost CAS on the catalog root.
pub fn record_cas_conflict() {
    counter!(CAS_CONFLICTS).increment(1);
}

/// Records packages processed in one phase.
pub fn record_packages(kind: &str, count: usize) {
    counter!(PACKAGES_PROCESSED, "kind" => kind.to_string()).increment(count as u64);
}

/// Records a fetch failure.
pub fn record_fetch_error(source: &str) {
    counter!(FETCH_ERRORS, "source" => source.to_string()).increment(1);
}
