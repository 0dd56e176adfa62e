//! Period lifecycle and metadata.
//!
//! A period is a directory with a shard database inside; the directory scan
//! is authoritative for existence. The shard's single-row `Period` table
//! only carries the date range and bookkeeping stamps. Renaming a period is
//! a directory rename, which moves the attachments with it; deleting one is
//! guarded by the shard being empty of deal rows.

use std::fs;

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::chain;
use crate::deal::timestamp_now;
use crate::error::{Result, StoreError};
use crate::router::{validate_period_name, ShardRouter};
use crate::schema::UNSET_DATE;

#[derive(Debug, Clone, Serialize)]
pub struct PeriodInfo {
    pub name: String,
    pub from_date: String,
    pub to_date: String,
    pub created: String,
    pub updated: String,
}

fn validate_date(value: &str) -> Result<()> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        StoreError::Validation(format!("date must be YYYY-MM-DD: '{value}'"))
    })?;
    Ok(())
}

fn validate_range(from: &str, to: &str) -> Result<()> {
    validate_date(from)?;
    validate_date(to)?;
    // ISO dates order lexicographically.
    if from > to {
        return Err(StoreError::Validation(format!(
            "period start {from} is after end {to}"
        )));
    }
    Ok(())
}

/// Metadata for one existing period. Dates read back as the `unset`
/// sentinel until a range is configured.
pub fn get_period(router: &ShardRouter, name: &str) -> Result<PeriodInfo> {
    let handle = router.connect_existing(name)?;
    let conn = handle.conn();
    let row = conn
        .query_row(
            "SELECT fromDate, toDate, created, updated FROM Period LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let (from_date, to_date, created, updated) = row.unwrap_or_else(|| {
        (
            UNSET_DATE.to_string(),
            UNSET_DATE.to_string(),
            String::new(),
            String::new(),
        )
    });

    Ok(PeriodInfo {
        name: name.to_string(),
        from_date,
        to_date,
        created,
        updated,
    })
}

/// Create a new period with a configured date range.
pub fn create_period(
    router: &ShardRouter,
    name: &str,
    from_date: &str,
    to_date: &str,
) -> Result<PeriodInfo> {
    validate_period_name(name)?;
    validate_range(from_date, to_date)?;
    if router.period_exists(name) {
        return Err(StoreError::PeriodExists(name.to_string()));
    }

    router.connect(name)?;
    update_period_dates(router, name, from_date, to_date)?;
    info!(period = name, from_date, to_date, "period created");
    get_period(router, name)
}

/// Set the date range on an existing period.
pub fn update_period_dates(
    router: &ShardRouter,
    name: &str,
    from_date: &str,
    to_date: &str,
) -> Result<()> {
    validate_range(from_date, to_date)?;

    let handle = router.connect_existing(name)?;
    handle.conn().execute(
        "UPDATE Period SET fromDate = ?1, toDate = ?2, updated = ?3",
        params![from_date, to_date, timestamp_now()],
    )?;
    Ok(())
}

/// Rename a period's directory, carrying the shard and attachments along.
/// The pooled handle for the old name is released first; callers holding a
/// stale `Arc<ShardHandle>` keep a working connection but a stale path.
pub fn rename_period(router: &ShardRouter, old: &str, new: &str) -> Result<()> {
    validate_period_name(new)?;
    if !router.period_exists(old) {
        return Err(StoreError::PeriodNotFound(old.to_string()));
    }
    if router.period_exists(new) {
        return Err(StoreError::PeriodExists(new.to_string()));
    }

    router.close(old);
    fs::rename(router.period_dir(old), router.period_dir(new))?;
    info!(old, new, "period renamed");
    Ok(())
}

/// Delete a period that holds no deal rows at all, live or historical.
pub fn delete_period(router: &ShardRouter, name: &str) -> Result<()> {
    let handle = router.connect_existing(name)?;
    let rows = chain::count_all(&handle)?;
    if rows > 0 {
        return Err(StoreError::PeriodNotEmpty(name.to_string()));
    }
    drop(handle);

    router.close(name);
    fs::remove_dir_all(router.period_dir(name))?;
    info!(period = name, "period deleted");
    Ok(())
}

/// Every known period with its metadata, sorted by name.
pub fn list_with_details(router: &ShardRouter) -> Result<Vec<PeriodInfo>> {
    let mut out = Vec::new();
    for name in router.list_known()? {
        out.push(get_period(router, &name)?);
    }
    Ok(out)
}
