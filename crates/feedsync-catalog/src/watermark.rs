//! Synchronization watermarks.
//!
//! The watermark records the last processed change timestamp per change kind.
//! It is persisted in the catalog root with every commit and is never written
//! anywhere else, so a restart resumes from the last durable commit.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// The earliest representable watermark (`0001-01-01T00:00:00Z`).
///
/// A watermark resolved to the floor means "never synchronized".
#[must_use]
pub fn floor() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::<Utc>::MIN_UTC, |naive| naive.and_utc())
}

/// Persisted watermark triple. Unset components have never been written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    /// Timestamp of the last committed created package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_created: Option<DateTime<Utc>>,
    /// Timestamp of the last committed edited package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited: Option<DateTime<Utc>>,
    /// Timestamp of the last committed deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deleted: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Verifies that `next` does not move any component backwards.
    ///
    /// A component may go from unset to set, or stay set and move forward (or
    /// stay equal). Clearing a set component is a regression.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::WatermarkRegression` naming the first component
    /// that regressed.
    pub fn check_advance(&self, next: &Self) -> Result<()> {
        let components = [
            ("lastCreated", self.last_created, next.last_created),
            ("lastEdited", self.last_edited, next.last_edited),
            ("lastDeleted", self.last_deleted, next.last_deleted),
        ];

        for (name, previous, proposed) in components {
            let Some(previous) = previous else { continue };
            match proposed {
                Some(proposed) if proposed >= previous => {}
                Some(proposed) => {
                    return Err(CatalogError::WatermarkRegression {
                        message: format!(
                            "{name} would move from {} back to {}",
                            previous.to_rfc3339(),
                            proposed.to_rfc3339()
                        ),
                    });
                }
                None => {
                    return Err(CatalogError::WatermarkRegression {
                        message: format!("{name} would be cleared (was {})", previous.to_rfc3339()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Resolves unset components into the starting point of a cycle.
    ///
    /// - `created` = stored, else `start_date`, else [`floor`]
    /// - `edited` and `deleted` = stored, else `created`
    /// - if `deleted` is still the floor, it starts from `edited` when creates
    ///   are skipped and from `created` otherwise
    #[must_use]
    pub fn resolve(&self, start_date: Option<DateTime<Utc>>, skip_created: bool) -> ResolvedWatermark {
        let created = self.last_created.or(start_date).unwrap_or_else(floor);
        let edited = self.last_edited.unwrap_or(created);
        let mut deleted = self.last_deleted.unwrap_or(created);
        if deleted == floor() {
            deleted = if skip_created { edited } else { created };
        }

        ResolvedWatermark {
            created,
            edited,
            deleted,
        }
    }
}

/// Watermark with every component resolved, as tracked during one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWatermark {
    /// Created packages strictly after this instant are pending.
    pub created: DateTime<Utc>,
    /// Edited packages strictly after this instant are pending.
    pub edited: DateTime<Utc>,
    /// Deletions strictly after this instant are pending.
    pub deleted: DateTime<Utc>,
}

impl ResolvedWatermark {
    /// Returns true if deletions should be fetched this cycle.
    #[must_use]
    pub fn deletes_enabled(&self) -> bool {
        self.deleted > floor()
    }

    /// Converts to the persisted form.
    #[must_use]
    pub fn to_watermark(&self) -> Watermark {
        Watermark {
            last_created: Some(self.created),
            last_edited: Some(self.edited),
            last_deleted: Some(self.deleted),
        }
    }
}
