//! OData HTTP feed client.
//!
//! Queries `{gallery}/Packages` with a `gt` filter on the change timestamp,
//! ordered ascending by the same field. Responses are OData JSON, either the
//! verbose form (`{"d": {"results": [...]}}`) or the light form
//! (`{"value": [...]}`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use feedsync_core::PackageIdentity;

use crate::delta::{ChangeKind, FeedClient, FeedPackageDetails};
use crate::error::{CatalogError, Result};
use crate::metrics;

/// Default request timeout for feed queries.
pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(300);

const SELECT_FIELDS: &str =
    "Id,NormalizedVersion,Created,LastEdited,Published,LicenseNames,LicenseReportUrl";

/// [`FeedClient`] backed by an OData package feed.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
    gallery: String,
}

impl HttpFeedClient {
    /// Creates a client for the feed rooted at `gallery`.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Feed` if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(gallery: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(gallery)
            .map_err(|e| CatalogError::feed(format!("invalid gallery URL '{gallery}': {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::feed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            gallery: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Builds the query URL for `kind` changes after `since`.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Feed` if the URL cannot be assembled.
    pub fn changed_since_url(
        &self,
        kind: ChangeKind,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<reqwest::Url> {
        let field = kind.field();
        let filter = format!("{field} gt DateTime'{}'", odata_timestamp(since));
        let top = top.to_string();

        reqwest::Url::parse_with_params(
            &format!("{}/Packages", self.gallery),
            [
                ("$filter", filter.as_str()),
                ("$orderby", field),
                ("$top", top.as_str()),
                ("$select", SELECT_FIELDS),
                ("semVerLevel", "2.0.0"),
            ],
        )
        .map_err(|e| CatalogError::feed(format!("invalid feed query URL: {e}")))
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn get_changed_since(
        &self,
        kind: ChangeKind,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<FeedPackageDetails>> {
        let url = self.changed_since_url(kind, since, top)?;
        tracing::debug!(kind = %kind, url = %url, "querying feed");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                metrics::record_fetch_error("feed");
                if e.is_timeout() {
                    CatalogError::feed(format!("feed request timed out: {e}"))
                } else {
                    CatalogError::feed(format!("feed request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            metrics::record_fetch_error("feed");
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::feed(format!(
                "feed returned status {status}: {body}"
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            metrics::record_fetch_error("feed");
            CatalogError::feed(format!("feed response is not JSON: {e}"))
        })?;

        parse_feed_response(&body)
    }
}

/// Renders a timestamp with seven fractional digits, the round-trip form the
/// feed expects in `DateTime'...'` literals.
fn odata_timestamp(at: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        at.format("%Y-%m-%dT%H:%M:%S"),
        at.timestamp_subsec_nanos() / 100
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ODataPackage {
    id: String,
    normalized_version: String,
    created: String,
    #[serde(default)]
    last_edited: Option<String>,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    license_names: Option<String>,
    #[serde(default)]
    license_report_url: Option<String>,
}

/// Parses an OData response body into feed packages.
///
/// Entries with an invalid identity are skipped with a warning; an entry with
/// an unparseable creation date fails the whole response.
///
/// # Errors
///
/// Returns `CatalogError::Feed` if the body has neither `d.results` nor
/// `value`, or an entry is malformed.
pub fn parse_feed_response(body: &Value) -> Result<Vec<FeedPackageDetails>> {
    let entries = body
        .get("d")
        .and_then(|d| d.get("results").or(Some(d)))
        .and_then(Value::as_array)
        .or_else(|| body.get("value").and_then(Value::as_array))
        .ok_or_else(|| CatalogError::feed("feed response has no result array"))?;

    let mut packages = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw: ODataPackage = serde_json::from_value(entry.clone())
            .map_err(|e| CatalogError::feed(format!("malformed feed entry: {e}")))?;

        let identity = match PackageIdentity::new(&raw.id, &raw.normalized_version) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(
                    id = %raw.id,
                    version = %raw.normalized_version,
                    error = %e,
                    "skipping feed entry with invalid identity"
                );
                continue;
            }
        };

        let created = parse_feed_datetime(&raw.created).ok_or_else(|| {
            CatalogError::feed(format!("{identity}: invalid Created '{}'", raw.created))
        })?;

        packages.push(FeedPackageDetails {
            identity,
            created,
            last_edited: raw.last_edited.as_deref().and_then(parse_feed_datetime),
            published: raw.published.as_deref().and_then(parse_feed_datetime),
            license_names: raw.license_names.filter(|s| !s.is_empty()),
            license_report_url: raw.license_report_url.filter(|s| !s.is_empty()),
        });
    }

    Ok(packages)
}

/// Parses the date forms OData feeds emit: `/Date(millis)/`, RFC 3339, and
/// offset-less ISO 8601 (taken as UTC).
#[must_use]
pub fn parse_feed_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Some(inner) = value
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        let millis = inner
            .find(['+', '-'])
            .filter(|&i| i > 0)
            .map_or(inner, |i| &inner[..i]);
        return millis
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    #[test]
    fn builds_created_query() {
        let client = HttpFeedClient::new("https://gallery.example/api/v2/", DEFAULT_FEED_TIMEOUT)
            .expect("client");
        let since = Utc
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .single()
            .expect("valid");
        let url = client
            .changed_since_url(ChangeKind::Created, since, 20)
            .expect("url");

        assert_eq!(url.path(), "/api/v2/Packages");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&(
            "$filter".into(),
            "Created gt DateTime'2024-01-02T03:04:05.0000000Z'".into()
        )));
        assert!(pairs.contains(&("$orderby".into(), "Created".into())));
        assert!(pairs.contains(&("$top".into(), "20".into())));
        assert!(pairs.contains(&("semVerLevel".into(), "2.0.0".into())));
    }

    #[test]
    fn edited_query_orders_by_last_edited() {
        let client = HttpFeedClient::new("https://gallery.example/api/v2", DEFAULT_FEED_TIMEOUT)
            .expect("client");
        let url = client
            .changed_since_url(ChangeKind::Edited, Utc::now(), 5)
            .expect("url");
        let orderby = url
            .query_pairs()
            .find(|(k, _)| k == "$orderby")
            .map(|(_, v)| v.into_owned());
        assert_eq!(orderby.as_deref(), Some("LastEdited"));
    }

    #[test]
    fn odata_timestamp_keeps_sub_second_ticks() {
        let at = Utc
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .single()
            .expect("valid")
            + chrono::Duration::nanoseconds(123_456_700);
        assert_eq!(odata_timestamp(at), "2024-01-02T03:04:05.1234567Z");
    }

    #[test]
    fn rejects_invalid_gallery() {
        assert!(HttpFeedClient::new("not a url", DEFAULT_FEED_TIMEOUT).is_err());
    }

    #[test]
    fn parses_verbose_and_light_odata() {
        let verbose = serde_json::json!({
            "d": {"results": [{
                "Id": "Contoso.Lib",
                "NormalizedVersion": "1.0.0",
                "Created": "/Date(1704164645000)/",
                "LastEdited": null,
                "Published": "1900-01-01T00:00:00",
                "LicenseNames": "",
                "LicenseReportUrl": null
            }]}
        });
        let packages = parse_feed_response(&verbose).expect("parse");
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].created.year(), 2024);
        assert!(!packages[0].is_listed());
        assert!(packages[0].license_names.is_none());

        let light = serde_json::json!({
            "value": [{
                "Id": "Other",
                "NormalizedVersion": "2.0.0",
                "Created": "2024-05-01T00:00:00Z",
                "LastEdited": "2024-05-02T00:00:00Z"
            }]
        });
        let packages = parse_feed_response(&light).expect("parse");
        assert_eq!(
            packages[0].timestamp(ChangeKind::Edited),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).single()
        );
    }

    #[test]
    fn skips_invalid_identities_but_fails_on_bad_dates() {
        let body = serde_json::json!({"value": [
            {"Id": "", "NormalizedVersion": "1.0.0", "Created": "2024-05-01T00:00:00Z"},
            {"Id": "Ok", "NormalizedVersion": "1.0.0", "Created": "2024-05-01T00:00:00Z"}
        ]});
        assert_eq!(parse_feed_response(&body).expect("parse").len(), 1);

        let bad = serde_json::json!({"value": [
            {"Id": "Ok", "NormalizedVersion": "1.0.0", "Created": "yesterday"}
        ]});
        assert!(parse_feed_response(&bad).is_err());
        assert!(parse_feed_response(&serde_json::json!({"nope": 1})).is_err());
    }

    #[test]
    fn parses_date_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single();
        assert_eq!(parse_feed_datetime("/Date(1704164645000)/"), expected);
        assert_eq!(parse_feed_datetime("/Date(1704164645000+0000)/"), expected);
        assert_eq!(parse_feed_datetime("2024-01-02T03:04:05Z"), expected);
        assert_eq!(parse_feed_datetime("2024-01-02T03:04:05.000"), expected);
        assert_eq!(parse_feed_datetime("garbage"), None);
    }
}
