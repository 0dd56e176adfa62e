//! VersionChain — the create/supersede/delete state machine.
//!
//! Edits never overwrite: superseding a deal flips the old row to
//! `UPDATE` and inserts a fresh `NEW` row linked via `prevNO`/`nextNO`,
//! all inside one shard-local transaction. Deletes flip the head's status
//! only; the attachment stays on disk.
//!
//! Invariant maintained here: for any lineage at most one row has
//! `nextNO IS NULL AND RecStatus IN ('NEW','DELETE')` — the head.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use crate::deal::{timestamp_now, Deal, DealDraft, DealFilter, RecStatus};
use crate::deal_number::{self, OriginTag};
use crate::error::{Result, StoreError};
use crate::router::ShardHandle;

/// Upper bound on collision-avoidance retries during number allocation.
pub(crate) const MAX_SEQUENCE_ATTEMPTS: u32 = 100;

const DEAL_COLUMNS: &str = "NO, nextNO, prevNO, DealType, DealDate, DealName, DealPartner, \
     DealPrice, DealRemark, RecUpdate, RegDate, RecStatus, FilePath, Hash";

pub(crate) fn deal_from_row(row: &Row<'_>) -> rusqlite::Result<Deal> {
    let status: String = row.get(11)?;
    Ok(Deal {
        no: row.get(0)?,
        next_no: row.get(1)?,
        prev_no: row.get(2)?,
        deal_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        deal_date: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        deal_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        deal_partner: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        deal_price: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
        deal_remark: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        rec_update: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        reg_date: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        rec_status: RecStatus::from_db(&status).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                11,
                rusqlite::types::Type::Text,
                format!("unknown RecStatus: {status}").into(),
            )
        })?,
        file_path: row.get(12)?,
        hash: row.get(13)?,
    })
}

/// True if a row with this number exists in the shard.
pub fn exists(handle: &ShardHandle, no: &str) -> Result<bool> {
    let conn = handle.conn();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM Deals WHERE NO = ?1",
        params![no],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Point lookup by number.
pub fn get(handle: &ShardHandle, no: &str) -> Result<Deal> {
    let conn = handle.conn();
    let deal = conn
        .query_row(
            &format!("SELECT {DEAL_COLUMNS} FROM Deals WHERE NO = ?1"),
            params![no],
            deal_from_row,
        )
        .optional()?;
    deal.ok_or_else(|| StoreError::DealNotFound(no.to_string()))
}

/// Allocate a free deal number.
///
/// Synthesizes timestamp+origin, then walks the sequence-suffix chain
/// (`-01`, `-02`, ...) until an unused number is found. The loop tolerates
/// races better than a single retry; a full chain is a conflict.
pub fn allocate_number(handle: &ShardHandle, origin: &OriginTag) -> Result<String> {
    allocate_number_at(handle, origin, Utc::now())
}

pub(crate) fn allocate_number_at(
    handle: &ShardHandle,
    origin: &OriginTag,
    now: chrono::DateTime<Utc>,
) -> Result<String> {
    let mut no = deal_number::generate(origin, now);
    for _ in 0..MAX_SEQUENCE_ATTEMPTS {
        if !exists(handle, &no)? {
            return Ok(no);
        }
        no = deal_number::next_sequence(&no);
    }
    Err(StoreError::NumberExists(no))
}

/// Insert a brand-new head row (`RecStatus = NEW`, no pointers).
///
/// Timestamps are assigned here; the caller provides the confirmed number
/// and descriptive fields. Number collisions (also the racy kind that slip
/// past [`allocate_number`]) surface as `resource_conflict`.
pub fn create(
    handle: &ShardHandle,
    no: &str,
    draft: &DealDraft,
    file_path: Option<String>,
    hash: Option<String>,
) -> Result<Deal> {
    let now = timestamp_now();
    let deal = Deal {
        no: no.to_string(),
        next_no: None,
        prev_no: None,
        deal_type: draft.deal_type.clone(),
        deal_date: draft.deal_date.clone(),
        deal_name: draft.deal_name.clone(),
        deal_partner: draft.deal_partner.clone(),
        deal_price: draft.deal_price,
        deal_remark: draft.deal_remark.clone(),
        rec_update: now.clone(),
        reg_date: now,
        rec_status: RecStatus::New,
        file_path,
        hash,
    };

    let mut conn = handle.conn();
    let tx = conn.transaction()?;

    let taken: i64 = tx.query_row(
        "SELECT COUNT(*) FROM Deals WHERE NO = ?1",
        params![deal.no],
        |row| row.get(0),
    )?;
    if taken > 0 {
        return Err(StoreError::NumberExists(deal.no));
    }

    insert_row(&tx, &deal)?;
    tx.commit()?;

    debug!(period = handle.period(), no = %deal.no, "deal created");
    Ok(deal)
}

/// Supersede `old_no` with a new version in one shard-local transaction.
///
/// 1. Flip the old row to `UPDATE` and point `nextNO` at the successor,
///    guarded by `RecStatus = 'NEW'` (optimistic: a concurrent edit wins
///    exactly once).
/// 2. Insert the successor as `NEW` with `prevNO` pointing back.
///
/// All-or-nothing: any failure rolls the status flip back.
pub fn supersede(
    handle: &ShardHandle,
    old_no: &str,
    new_no: &str,
    draft: &DealDraft,
    file_path: Option<String>,
    hash: Option<String>,
) -> Result<Deal> {
    let now = timestamp_now();
    let successor = Deal {
        no: new_no.to_string(),
        next_no: None,
        prev_no: Some(old_no.to_string()),
        deal_type: draft.deal_type.clone(),
        deal_date: draft.deal_date.clone(),
        deal_name: draft.deal_name.clone(),
        deal_partner: draft.deal_partner.clone(),
        deal_price: draft.deal_price,
        deal_remark: draft.deal_remark.clone(),
        rec_update: now.clone(),
        reg_date: now.clone(),
        rec_status: RecStatus::New,
        file_path,
        hash,
    };

    let mut conn = handle.conn();
    let tx = conn.transaction()?;

    let affected = tx.execute(
        "UPDATE Deals SET RecStatus = 'UPDATE', nextNO = ?1, RecUpdate = ?2 \
         WHERE NO = ?3 AND RecStatus = 'NEW'",
        params![new_no, now, old_no],
    )?;

    if affected == 0 {
        // Distinguish "already superseded" from "absent".
        let status: Option<String> = tx
            .query_row(
                "SELECT RecStatus FROM Deals WHERE NO = ?1",
                params![old_no],
                |row| row.get(0),
            )
            .optional()?;
        return match status.as_deref() {
            Some("UPDATE") => Err(StoreError::AlreadySuperseded(old_no.to_string())),
            Some(_) => Err(StoreError::DealNotFoundOrDeleted(old_no.to_string())),
            None => Err(StoreError::DealNotFound(old_no.to_string())),
        };
    }

    insert_row(&tx, &successor)?;
    tx.commit()?;

    debug!(
        period = handle.period(),
        old = old_no,
        new = new_no,
        "deal superseded"
    );
    Ok(successor)
}

/// Logical delete: flip the head to `DELETE`, keep the file reference.
pub fn mark_deleted(handle: &ShardHandle, no: &str) -> Result<()> {
    let now = timestamp_now();
    let conn = handle.conn();
    let affected = conn.execute(
        "UPDATE Deals SET RecStatus = 'DELETE', RecUpdate = ?1 \
         WHERE NO = ?2 AND (RecStatus = 'NEW' OR RecStatus = 'UPDATE')",
        params![now, no],
    )?;
    if affected == 0 {
        return Err(StoreError::DealNotFoundOrDeleted(no.to_string()));
    }
    debug!(period = handle.period(), no, "deal logically deleted");
    Ok(())
}

/// Flat view: head rows only, filtered, ordered `DealDate DESC, NO DESC`.
///
/// Returns the page and the unpaginated total count.
pub fn list_flat(handle: &ShardHandle, filter: &DealFilter) -> Result<(Vec<Deal>, u64)> {
    list_heads(handle, filter, "DealDate DESC, NO DESC")
}

/// Head rows ordered by last mutation, for the history view.
pub(crate) fn list_heads_by_update(
    handle: &ShardHandle,
    filter: &DealFilter,
) -> Result<(Vec<Deal>, u64)> {
    list_heads(handle, filter, "RecUpdate DESC, NO DESC")
}

fn list_heads(
    handle: &ShardHandle,
    filter: &DealFilter,
    order_by: &str,
) -> Result<(Vec<Deal>, u64)> {
    let mut where_clause = String::from(
        " WHERE (RecStatus = 'NEW' OR RecStatus = 'DELETE') AND nextNO IS NULL",
    );
    let mut args: Vec<Value> = Vec::new();

    if let Some(from) = filter.from_date.as_deref().filter(|s| !s.is_empty()) {
        where_clause.push_str(&format!(" AND DealDate >= ?{}", args.len() + 1));
        args.push(Value::Text(from.to_string()));
    }
    if let Some(to) = filter.to_date.as_deref().filter(|s| !s.is_empty()) {
        where_clause.push_str(&format!(" AND DealDate <= ?{}", args.len() + 1));
        args.push(Value::Text(to.to_string()));
    }
    if let Some(partner) = filter.partner.as_deref().filter(|s| !s.is_empty()) {
        where_clause.push_str(&format!(" AND DealPartner LIKE ?{}", args.len() + 1));
        args.push(Value::Text(format!("%{partner}%")));
    }
    if let Some(deal_type) = filter.deal_type.as_deref().filter(|s| !s.is_empty()) {
        where_clause.push_str(&format!(" AND DealType = ?{}", args.len() + 1));
        args.push(Value::Text(deal_type.to_string()));
    }
    if let Some(keyword) = filter.keyword.as_deref().filter(|s| !s.is_empty()) {
        let n = args.len();
        where_clause.push_str(&format!(
            " AND (DealName LIKE ?{} OR DealRemark LIKE ?{} OR DealPartner LIKE ?{})",
            n + 1,
            n + 2,
            n + 3
        ));
        let pattern = format!("%{keyword}%");
        args.push(Value::Text(pattern.clone()));
        args.push(Value::Text(pattern.clone()));
        args.push(Value::Text(pattern));
    }

    let conn = handle.conn();

    let count_sql = format!("SELECT COUNT(*) FROM Deals{where_clause}");
    let total: i64 = conn.query_row(&count_sql, params_from_iter(args.iter()), |row| row.get(0))?;

    let mut sql = format!("SELECT {DEAL_COLUMNS} FROM Deals{where_clause} ORDER BY {order_by}");
    sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
    args.push(Value::Integer(i64::from(filter.limit.unwrap_or(1000))));
    if let Some(offset) = filter.offset.filter(|&o| o > 0) {
        sql.push_str(&format!(" OFFSET ?{}", args.len() + 1));
        args.push(Value::Integer(i64::from(offset)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let deals = stmt
        .query_map(params_from_iter(args.iter()), deal_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((deals, total as u64))
}

/// Total number of rows in the shard, heads and history alike.
pub fn count_all(handle: &ShardHandle) -> Result<u64> {
    let conn = handle.conn();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM Deals", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn insert_row(tx: &rusqlite::Transaction<'_>, deal: &Deal) -> Result<()> {
    tx.execute(
        "INSERT INTO Deals (NO, nextNO, prevNO, DealType, DealDate, DealName, \
         DealPartner, DealPrice, DealRemark, RecUpdate, RegDate, RecStatus, FilePath, Hash) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            deal.no,
            deal.next_no,
            deal.prev_no,
            deal.deal_type,
            deal.deal_date,
            deal.deal_name,
            deal.deal_partner,
            deal.deal_price,
            deal.deal_remark,
            deal.rec_update,
            deal.reg_date,
            deal.rec_status.as_str(),
            deal.file_path,
            deal.hash,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::NumberExists(deal.no.clone())
        }
        other => other.into(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::router::ShardRouter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn shard() -> (tempfile::TempDir, Arc<ShardHandle>) {
        let dir = tempdir().unwrap();
        let router = ShardRouter::open(StoreConfig::new(dir.path())).unwrap();
        let handle = router.connect("2024-01").unwrap();
        (dir, handle)
    }

    fn draft(partner: &str, price: i64) -> DealDraft {
        DealDraft {
            deal_type: "invoice".into(),
            deal_date: "2024-01-15".into(),
            deal_name: "office supplies".into(),
            deal_partner: partner.into(),
            deal_price: price,
            deal_remark: String::new(),
        }
    }

    fn head_count(handle: &ShardHandle, base: &str) -> i64 {
        handle
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM Deals \
                 WHERE (NO = ?1 OR NO LIKE ?2) \
                 AND nextNO IS NULL AND (RecStatus = 'NEW' OR RecStatus = 'DELETE')",
                params![base, format!("{base}-%")],
                |row| row.get(0),
            )
            .unwrap()
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    #[test]
    fn create_inserts_head_with_fresh_timestamps() {
        let (_dir, handle) = shard();
        let deal = create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();

        assert_eq!(deal.rec_status, RecStatus::New);
        assert!(deal.next_no.is_none());
        assert!(deal.prev_no.is_none());
        assert_eq!(deal.rec_update, deal.reg_date);

        let stored = get(&handle, "D1").unwrap();
        assert_eq!(stored.deal_partner, "Acme");
        assert!(stored.is_head());
    }

    #[test]
    fn create_rejects_duplicate_number() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();

        let err = create(&handle, "D1", &draft("Other", 1), None, None).unwrap_err();
        assert!(matches!(err, StoreError::NumberExists(_)));
        assert_eq!(err.code(), "resource_conflict");
    }

    #[test]
    fn allocate_number_steps_over_collisions() {
        use chrono::TimeZone;

        let (_dir, handle) = shard();
        let origin = OriginTag::fallback();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 25).unwrap();

        let first = allocate_number_at(&handle, &origin, now).unwrap();
        assert_eq!(first, "20240115143025PC000");
        create(&handle, &first, &draft("Acme", 1), None, None).unwrap();

        // Same second, same origin: the -01 variant is picked, then -02.
        let second = allocate_number_at(&handle, &origin, now).unwrap();
        assert_eq!(second, "20240115143025PC000-01");
        create(&handle, &second, &draft("Acme", 2), None, None).unwrap();

        let third = allocate_number_at(&handle, &origin, now).unwrap();
        assert_eq!(third, "20240115143025PC000-02");
    }

    // ------------------------------------------------------------------
    // Supersede
    // ------------------------------------------------------------------

    #[test]
    fn supersede_threads_the_pointers() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();

        supersede(&handle, "D1", "D1-1", &draft("Acme", 1200), None, None).unwrap();

        let old = get(&handle, "D1").unwrap();
        assert_eq!(old.rec_status, RecStatus::Updated);
        assert_eq!(old.next_no.as_deref(), Some("D1-1"));
        assert!(!old.is_head());

        let new = get(&handle, "D1-1").unwrap();
        assert_eq!(new.rec_status, RecStatus::New);
        assert_eq!(new.prev_no.as_deref(), Some("D1"));
        assert!(new.is_head());
        assert_eq!(new.deal_price, 1200);
    }

    #[test]
    fn supersede_twice_reports_already_superseded() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        supersede(&handle, "D1", "D1-1", &draft("Acme", 1200), None, None).unwrap();

        let err = supersede(&handle, "D1", "D1-2", &draft("Acme", 1300), None, None).unwrap_err();
        assert!(matches!(err, StoreError::AlreadySuperseded(_)));
    }

    #[test]
    fn supersede_missing_deal_reports_not_found() {
        let (_dir, handle) = shard();
        let err = supersede(&handle, "ghost", "ghost-1", &draft("Acme", 1), None, None).unwrap_err();
        assert!(matches!(err, StoreError::DealNotFound(_)));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn supersede_rolls_back_when_insert_fails() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        // Occupy the successor number so the insert step hits a
        // constraint violation after the guard update succeeded.
        create(&handle, "D1-1", &draft("Squat", 1), None, None).unwrap();

        let err = supersede(&handle, "D1", "D1-1", &draft("Acme", 1200), None, None).unwrap_err();
        assert!(matches!(err, StoreError::NumberExists(_)));

        // The old row's status change must have been rolled back.
        let old = get(&handle, "D1").unwrap();
        assert_eq!(old.rec_status, RecStatus::New);
        assert!(old.next_no.is_none());
    }

    #[test]
    fn head_uniqueness_holds_across_edit_chain() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        supersede(&handle, "D1", "D1-1", &draft("Acme", 1100), None, None).unwrap();
        supersede(&handle, "D1-1", "D1-2", &draft("Acme", 1200), None, None).unwrap();
        assert_eq!(head_count(&handle, "D1"), 1);

        mark_deleted(&handle, "D1-2").unwrap();
        assert_eq!(head_count(&handle, "D1"), 1);
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    #[test]
    fn delete_flips_status_and_keeps_file_reference() {
        let (_dir, handle) = shard();
        create(
            &handle,
            "D1",
            &draft("Acme", 1000),
            Some("D1_x.pdf".into()),
            Some("abc".into()),
        )
        .unwrap();

        mark_deleted(&handle, "D1").unwrap();

        let deal = get(&handle, "D1").unwrap();
        assert_eq!(deal.rec_status, RecStatus::Deleted);
        assert_eq!(deal.file_path.as_deref(), Some("D1_x.pdf"));
        assert!(deal.is_head());
    }

    #[test]
    fn delete_twice_reports_not_found_or_deleted() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        mark_deleted(&handle, "D1").unwrap();

        let err = mark_deleted(&handle, "D1").unwrap_err();
        assert!(matches!(err, StoreError::DealNotFoundOrDeleted(_)));
        assert_eq!(err.code(), "not_found");
    }

    // ------------------------------------------------------------------
    // Flat view
    // ------------------------------------------------------------------

    #[test]
    fn flat_view_returns_heads_only() {
        let (_dir, handle) = shard();
        create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        supersede(&handle, "D1", "D1-1", &draft("Acme", 1100), None, None).unwrap();
        create(&handle, "D2", &draft("Globex", 500), None, None).unwrap();
        mark_deleted(&handle, "D2").unwrap();

        let (deals, total) = list_flat(&handle, &DealFilter::default()).unwrap();
        assert_eq!(total, 2);
        let nos: Vec<&str> = deals.iter().map(|d| d.no.as_str()).collect();
        assert!(nos.contains(&"D1-1"));
        assert!(nos.contains(&"D2")); // deleted heads stay visible
        assert!(!nos.contains(&"D1")); // superseded rows do not
    }

    #[test]
    fn flat_view_filters_and_paginates() {
        let (_dir, handle) = shard();
        for (no, date, partner) in [
            ("D1", "2024-01-10", "Acme"),
            ("D2", "2024-01-20", "Acme"),
            ("D3", "2024-01-25", "Globex"),
        ] {
            let mut d = draft(partner, 100);
            d.deal_date = date.into();
            create(&handle, no, &d, None, None).unwrap();
        }

        let filter = DealFilter {
            partner: Some("Acme".into()),
            ..Default::default()
        };
        let (deals, total) = list_flat(&handle, &filter).unwrap();
        assert_eq!(total, 2);
        // DealDate DESC
        assert_eq!(deals[0].no, "D2");
        assert_eq!(deals[1].no, "D1");

        let filter = DealFilter {
            from_date: Some("2024-01-15".into()),
            limit: Some(1),
            ..Default::default()
        };
        let (page, total) = list_flat(&handle, &filter).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].no, "D3");

        let filter = DealFilter {
            from_date: Some("2024-01-15".into()),
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        };
        let (page, _) = list_flat(&handle, &filter).unwrap();
        assert_eq!(page[0].no, "D2");
    }

    #[test]
    fn flat_view_keyword_searches_name_remark_partner() {
        let (_dir, handle) = shard();
        let mut d = draft("Acme", 100);
        d.deal_remark = "quarterly retainer".into();
        create(&handle, "D1", &d, None, None).unwrap();
        create(&handle, "D2", &draft("Globex", 100), None, None).unwrap();

        let filter = DealFilter {
            keyword: Some("retainer".into()),
            ..Default::default()
        };
        let (deals, total) = list_flat(&handle, &filter).unwrap();
        assert_eq!(total, 1);
        assert_eq!(deals[0].no, "D1");
    }
}
