//! Partner master list, kept in the system database.
//!
//! Partner names are denormalized into every deal row, so a rename has to
//! fan out over all known periods. Deletion is guarded: a partner that any
//! deal row still references cannot be removed.

use rusqlite::params;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::router::ShardRouter;

/// All registered partner names, sorted.
pub fn list_partners(router: &ShardRouter) -> Result<Vec<String>> {
    let conn = router.system().conn();
    let mut stmt = conn.prepare("SELECT name FROM DealPartners ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub fn add_partner(router: &ShardRouter, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation(
            "partner name is required".to_string(),
        ));
    }

    let conn = router.system().conn();
    match conn.execute("INSERT INTO DealPartners (name) VALUES (?1)", params![name]) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::PartnerExists(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Rename a partner and rewrite every deal row that references the old name.
///
/// The master-list rename commits first; the per-period rewrites follow. A
/// period that fails mid-propagation leaves earlier periods already
/// rewritten, so the caller should retry the rename until it succeeds.
/// Attachment file names are not rewritten; they keep the name that was
/// current when the file was stored.
pub fn rename_partner(router: &ShardRouter, old: &str, new: &str) -> Result<()> {
    if new.trim().is_empty() {
        return Err(StoreError::Validation(
            "partner name is required".to_string(),
        ));
    }

    {
        let conn = router.system().conn();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM DealPartners WHERE name = ?1",
            params![new],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(StoreError::PartnerExists(new.to_string()));
        }

        let changed = conn.execute(
            "UPDATE DealPartners SET name = ?1 WHERE name = ?2",
            params![new, old],
        )?;
        if changed == 0 {
            return Err(StoreError::PartnerNotFound(old.to_string()));
        }
    }

    let mut rewritten = 0usize;
    for period in router.list_known()? {
        let handle = router.connect_existing(&period)?;
        let conn = handle.conn();
        rewritten += conn.execute(
            "UPDATE Deals SET DealPartner = ?1 WHERE DealPartner = ?2",
            params![new, old],
        )?;
    }

    info!(old, new, rewritten, "partner renamed");
    Ok(())
}

/// Remove a partner from the master list. Fails while any deal row in any
/// period still references the name, live or historical.
pub fn delete_partner(router: &ShardRouter, name: &str) -> Result<()> {
    for period in router.list_known()? {
        let handle = router.connect_existing(&period)?;
        let count: i64 = handle.conn().query_row(
            "SELECT COUNT(*) FROM Deals WHERE DealPartner = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if count > 0 {
            return Err(StoreError::PartnerInUse {
                name: name.to_string(),
                count: count as u64,
                period,
            });
        }
    }

    let conn = router.system().conn();
    let changed = conn.execute(
        "DELETE FROM DealPartners WHERE name = ?1",
        params![name],
    )?;
    if changed == 0 {
        return Err(StoreError::PartnerNotFound(name.to_string()));
    }
    Ok(())
}
