//! Catalog item creation from feed metadata.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::{Map, Value};

use crate::delta::FeedPackageDetails;
use crate::error::Result;
use crate::writer::CatalogItem;

/// Renders the catalog item for a created or edited package.
#[async_trait]
pub trait CatalogItemCreator: Send + Sync {
    /// Creates the item for `package`.
    async fn create(&self, package: &FeedPackageDetails) -> Result<CatalogItem>;
}

/// Creator that renders a details leaf purely from feed metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedMetadataItemCreator;

#[async_trait]
impl CatalogItemCreator for FeedMetadataItemCreator {
    async fn create(&self, package: &FeedPackageDetails) -> Result<CatalogItem> {
        let mut content = Map::new();
        content.insert("id".into(), Value::from(package.identity.id.as_str()));
        content.insert(
            "version".into(),
            Value::from(package.identity.version.as_str()),
        );
        content.insert("created".into(), Value::from(package.created.to_rfc3339()));
        if let Some(edited) = package.last_edited {
            content.insert("lastEdited".into(), Value::from(edited.to_rfc3339()));
        }
        if let Some(published) = package.published {
            content.insert("published".into(), Value::from(published.to_rfc3339()));
        }
        content.insert("listed".into(), Value::from(package.is_listed()));
        content.insert(
            "isPrerelease".into(),
            Value::from(package.identity.version.is_prerelease()),
        );
        if let Some(license) = &package.license_names {
            content.insert("licenseNames".into(), Value::from(license.as_str()));
        }
        if let Some(url) = &package.license_report_url {
            content.insert("licenseReportUrl".into(), Value::from(url.as_str()));
        }

        Ok(CatalogItem::details(package.identity.clone(), content))
    }
}

/// Creates items for `packages` with at most `parallelism` creations in
/// flight. Output order matches input order.
///
/// # Errors
///
/// Returns the first creation error.
pub async fn create_items(
    creator: &Arc<dyn CatalogItemCreator>,
    packages: &[FeedPackageDetails],
    parallelism: usize,
) -> Result<Vec<CatalogItem>> {
    let pending: Vec<_> = packages.iter().map(|package| creator.create(package)).collect();
    stream::iter(pending)
        .buffered(parallelism.max(1))
        .try_collect()
        .await
}
