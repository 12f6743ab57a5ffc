//! Search publication metrics.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Batch Metrics
// ============================================================================

/// Index batches submitted, labelled by logical index.
pub const INDEX_BATCHES: &str = "feedsync_index_batches_total";

/// Index actions submitted, labelled by logical index.
pub const INDEX_ACTIONS: &str = "feedsync_index_actions_total";

/// Documents rejected by the index, labelled by logical index.
pub const INDEXING_ERRORS: &str = "feedsync_indexing_errors_total";

/// Batch submission duration histogram.
pub const BATCH_DURATION: &str = "feedsync_index_batch_duration_seconds";

// ============================================================================
// Version List Metrics
// ============================================================================

/// Version lists written.
pub const VERSION_LISTS_UPDATED: &str = "feedsync_version_lists_updated_total";

/// Version list writes refused by the access condition.
pub const VERSION_LIST_CONFLICTS: &str = "feedsync_version_list_conflicts_total";

// ============================================================================
// Publication Metrics
// ============================================================================

/// Catalog items published to the index.
pub const ITEMS_PUBLISHED: &str = "feedsync_items_published_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all search metric descriptions.
///
/// Call this once at application startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(INDEX_BATCHES, "Total index batches submitted");
    describe_counter!(INDEX_ACTIONS, "Total index actions submitted");
    describe_counter!(INDEXING_ERRORS, "Total documents rejected by the index");
    describe_histogram!(BATCH_DURATION, "Duration of index batch submissions in seconds");
    describe_counter!(VERSION_LISTS_UPDATED, "Total version lists written");
    describe_counter!(
        VERSION_LIST_CONFLICTS,
        "Total version list writes refused by the access condition"
    );
    describe_counter!(ITEMS_PUBLISHED, "Total catalog items published to the index");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records a submitted batch.
pub fn record_batch(index: &str, actions: usize, errors: usize, duration_secs: f64) {
    let index = index.to_string();
    counter!(INDEX_BATCHES, "index" => index.clone()).increment(1);
    counter!(INDEX_ACTIONS, "index" => index.clone()).increment(actions as u64);
    if errors > 0 {
        counter!(INDEXING_ERRORS, "index" => index.clone()).increment(errors as u64);
    }
    histogram!(BATCH_DURATION, "index" => index).record(duration_secs);
}

/// Records a written version list.
pub fn record_version_list_updated() {
    counter!(VERSION_LISTS_UPDATED).increment(1);
}

/// Records a refused version list write.
pub fn record_version_list_conflict() {
    counter!(VERSION_LIST_CONFLICTS).increment(1);
}

/// Records catalog items published in one pass.
pub fn record_items_published(count: usize) {
    counter!(ITEMS_PUBLISHED).increment(count as u64);
}
