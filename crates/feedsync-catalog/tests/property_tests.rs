//! Property-based tests for feedsync-catalog invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use tokio_test::block_on;

use feedsync_catalog::{
    AppendOnlyCatalogWriter, CatalogItem, CatalogReader, Watermark, segment_deletes,
};
use feedsync_core::{MemoryBackend, PackageIdentity, ScopedStorage};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid")
}

/// Generates a small identity space so that repeats are common.
fn arb_identity() -> impl Strategy<Value = PackageIdentity> {
    (
        prop::sample::select(vec!["A", "b", "C", "d"]),
        prop::sample::select(vec!["1.0.0", "2.0.0", "1.0.0-beta"]),
    )
        .prop_map(|(id, version)| PackageIdentity::new(id, version).expect("identity"))
}

/// Generates deletions keyed by timestamp, as the fetcher produces them.
fn arb_deletes() -> impl Strategy<Value = BTreeMap<DateTime<Utc>, Vec<PackageIdentity>>> {
    prop::collection::vec((0i64..20, prop::collection::vec(arb_identity(), 1..4)), 0..12)
        .prop_map(|buckets| {
            let mut deletes: BTreeMap<DateTime<Utc>, Vec<PackageIdentity>> = BTreeMap::new();
            for (minute, identities) in buckets {
                deletes
                    .entry(base() + Duration::minutes(minute))
                    .or_default()
                    .extend(identities);
            }
            deletes
        })
}

proptest! {
    #[test]
    fn segments_never_repeat_an_identity(deletes in arb_deletes()) {
        for segment in segment_deletes(&deletes) {
            let mut seen = HashSet::new();
            for (_, identities) in segment.iter() {
                for identity in identities {
                    prop_assert!(seen.insert(identity.clone()), "{identity} repeated");
                }
            }
        }
    }

    #[test]
    fn segments_concatenate_to_the_input(deletes in arb_deletes()) {
        let expected: Vec<(DateTime<Utc>, PackageIdentity)> = deletes
            .iter()
            .flat_map(|(at, ids)| ids.iter().map(move |id| (*at, id.clone())))
            .collect();

        let actual: Vec<(DateTime<Utc>, PackageIdentity)> = segment_deletes(&deletes)
            .iter()
            .flat_map(|segment| {
                segment
                    .iter()
                    .flat_map(|(at, ids)| ids.iter().map(move |id| (*at, id.clone())))
                    .collect::<Vec<_>>()
            })
            .collect();

        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn segment_count_is_minimal_for_a_single_identity(repeats in 1usize..6) {
        let id = PackageIdentity::new("A", "1.0.0").expect("identity");
        let deletes: BTreeMap<_, _> = (0..repeats)
            .map(|n| (base() + Duration::minutes(n as i64), vec![id.clone()]))
            .collect();
        prop_assert_eq!(segment_deletes(&deletes).len(), repeats);
    }

    #[test]
    fn committed_watermarks_never_regress(steps in prop::collection::vec((0i64..4, 0i64..4), 1..8)) {
        block_on(async {
            let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "catalog")
                .expect("scope");
            let mut writer = AppendOnlyCatalogWriter::new(storage.clone());
            let reader = CatalogReader::new(storage);

            let mut created = base();
            let mut edited = base();
            for (n, (dc, de)) in steps.into_iter().enumerate() {
                // Advance by a random (possibly zero) amount, or step back.
                let proposal_created = created + Duration::minutes(dc - 1);
                let proposal_edited = edited + Duration::minutes(de - 1);
                let watermark = Watermark {
                    last_created: Some(proposal_created),
                    last_edited: Some(proposal_edited),
                    last_deleted: Some(base()),
                };

                let identity = PackageIdentity::new(&format!("P{n}"), "1.0.0").expect("identity");
                writer.add(CatalogItem::details(identity, serde_json::Map::new()));
                let before = reader.watermark().await.expect("watermark");

                match writer.commit(watermark).await {
                    Ok(_) => {
                        prop_assert!(proposal_created >= created || n == 0);
                        prop_assert!(proposal_edited >= edited || n == 0);
                        created = proposal_created;
                        edited = proposal_edited;
                    }
                    Err(err) => {
                        prop_assert!(err.is_defect());
                        writer.discard();
                        prop_assert_eq!(reader.watermark().await.expect("watermark"), before);
                    }
                }

                let stored = reader.watermark().await.expect("watermark");
                if let (Some(prev_c), Some(now_c)) = (before.last_created, stored.last_created) {
                    prop_assert!(now_c >= prev_c);
                }
                if let (Some(prev_e), Some(now_e)) = (before.last_edited, stored.last_edited) {
                    prop_assert!(now_e >= prev_e);
                }
            }
            Ok(())
        })?;
    }
}
