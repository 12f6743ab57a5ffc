//! Index action building.
//!
//! Projects the catalog changes of one package id into index actions and the
//! updated version list.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use feedsync_core::{NormalizedVersion, PackageId, PackageIdentity};

use crate::error::{Result, SearchError};
use crate::index::{IndexAction, IndexActions};
use crate::version_list::{ResultAndAccessCondition, VersionListData, VersionListDataClient};

/// What happened to one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChangeKind {
    /// The version was created or edited.
    Upsert {
        /// Listing state after the change.
        listed: bool,
    },
    /// The version was deleted.
    Delete,
}

/// One version-level change of a package id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    /// The changed release.
    pub identity: PackageIdentity,
    /// What happened to it.
    pub kind: VersionChangeKind,
}

impl VersionChange {
    /// A created or edited version.
    #[must_use]
    pub fn upsert(identity: PackageIdentity, listed: bool) -> Self {
        Self {
            identity,
            kind: VersionChangeKind::Upsert { listed },
        }
    }

    /// A deleted version.
    #[must_use]
    pub fn delete(identity: PackageIdentity) -> Self {
        Self {
            identity,
            kind: VersionChangeKind::Delete,
        }
    }
}

/// Turns the changes of one package id into index actions.
#[async_trait]
pub trait IndexActionBuilder: Send + Sync {
    /// Builds the actions for `changes`, all of which belong to `package_id`.
    async fn build(&self, package_id: &PackageId, changes: &[VersionChange]) -> Result<IndexActions>;
}

/// Hijack document key of a release.
#[must_use]
pub fn hijack_key(identity: &PackageIdentity) -> String {
    format!("{}_{}", identity.id.key(), identity.version.key())
}

/// Search document key of a package id.
#[must_use]
pub fn search_key(package_id: &PackageId) -> String {
    package_id.key().to_string()
}

/// Builder producing one hijack action per changed version and one search
/// action per package id.
#[derive(Clone)]
pub struct DefaultIndexActionBuilder {
    version_lists: Arc<dyn VersionListDataClient>,
}

impl std::fmt::Debug for DefaultIndexActionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultIndexActionBuilder").finish_non_exhaustive()
    }
}

impl DefaultIndexActionBuilder {
    /// Creates a builder reading version lists from `version_lists`.
    #[must_use]
    pub fn new(version_lists: Arc<dyn VersionListDataClient>) -> Self {
        Self { version_lists }
    }
}

#[async_trait]
impl IndexActionBuilder for DefaultIndexActionBuilder {
    async fn build(&self, package_id: &PackageId, changes: &[VersionChange]) -> Result<IndexActions> {
        let ResultAndAccessCondition {
            result: mut version_list,
            access_condition,
        } = self.version_lists.read(package_id).await?;

        let mut hijack = Vec::with_capacity(changes.len());
        for change in changes {
            let identity = &change.identity;
            if identity.id != *package_id {
                return Err(SearchError::invariant(format!(
                    "change for {identity} built under package id {package_id}"
                )));
            }

            match change.kind {
                VersionChangeKind::Upsert { listed } => {
                    version_list.upsert(identity.version.key(), listed);
                    hijack.push(hijack_action(identity, listed));
                }
                VersionChangeKind::Delete => {
                    version_list.remove(identity.version.key());
                    hijack.push(IndexAction::delete(hijack_key(identity)));
                }
            }
        }

        let search = vec![search_action(package_id, &version_list)];
        Ok(IndexActions {
            search,
            hijack,
            version_list: ResultAndAccessCondition {
                result: version_list,
                access_condition,
            },
        })
    }
}

/// The version-level document of a release.
pub(crate) fn hijack_action(identity: &PackageIdentity, listed: bool) -> IndexAction {
    IndexAction::merge_or_upload(
        hijack_key(identity),
        json!({
            "packageId": identity.id.as_str(),
            "version": identity.version.as_str(),
            "listed": listed,
            "isPrerelease": identity.version.is_prerelease(),
        }),
    )
}

/// The package-level document, or a delete when nothing is listed.
pub(crate) fn search_action(package_id: &PackageId, version_list: &VersionListData) -> IndexAction {
    let mut listed: Vec<NormalizedVersion> = version_list
        .listed()
        .filter_map(|v| NormalizedVersion::parse(v).ok())
        .collect();
    if listed.is_empty() {
        return IndexAction::delete(search_key(package_id));
    }
    listed.sort();

    let latest = listed.last().map(NormalizedVersion::as_str);
    let latest_stable = listed
        .iter()
        .rev()
        .find(|v| !v.is_prerelease())
        .map(NormalizedVersion::as_str);
    let versions: Vec<&str> = listed.iter().map(NormalizedVersion::as_str).collect();

    IndexAction::upload(
        search_key(package_id),
        json!({
            "packageId": package_id.as_str(),
            "versions": versions,
            "latestVersion": latest,
            "latestStableVersion": latest_stable,
        }),
    )
}
