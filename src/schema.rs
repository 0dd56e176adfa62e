//! Idempotent DDL for shard and system databases.
//!
//! Every statement is "create if missing" or a guarded seed insert; running
//! the sequence against a shard that already holds data changes nothing.
//! A statement failure aborts shard setup and the shard is not registered.

use rusqlite::Connection;

use crate::error::Result;

/// Sentinel for period metadata dates that have not been configured yet.
pub const UNSET_DATE: &str = "unset";

const SHARD_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS "Deals" (
        "NO" TEXT NOT NULL UNIQUE,
        "nextNO" TEXT,
        "prevNO" TEXT,
        "DealType" TEXT,
        "DealDate" TEXT,
        "DealName" TEXT,
        "DealPartner" TEXT,
        "DealPrice" INTEGER,
        "DealRemark" TEXT,
        "RecUpdate" TEXT,
        "RegDate" TEXT,
        "RecStatus" TEXT,
        "FilePath" TEXT,
        "Hash" TEXT,
        PRIMARY KEY("NO")
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "Period" (
        "fromDate" TEXT,
        "toDate" TEXT,
        "created" TEXT,
        "updated" TEXT
    )"#,
    r#"INSERT INTO Period (fromDate, toDate, created, updated)
       SELECT 'unset', 'unset', datetime('now'), datetime('now')
       WHERE NOT EXISTS (SELECT 1 FROM Period)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_hash ON Deals (Hash)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_deal_date ON Deals (DealDate)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_deal_partner ON Deals (DealPartner)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_deal_type ON Deals (DealType)"#,
];

const SYSTEM_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS "DealPartners" (
        "name" TEXT PRIMARY KEY
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "System" (
        "AppVersion" TEXT,
        "SQLiteLibraryVersion" TEXT
    )"#,
];

/// Apply the shard schema to a freshly opened period database.
pub fn apply_shard_schema(conn: &Connection) -> Result<()> {
    for stmt in SHARD_SCHEMA {
        conn.execute(stmt, [])?;
    }
    Ok(())
}

/// Apply the system schema and seed the version row if the table is empty.
pub fn apply_system_schema(conn: &Connection) -> Result<()> {
    for stmt in SYSTEM_SCHEMA {
        conn.execute(stmt, [])?;
    }

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM System", [], |row| row.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO System (AppVersion, SQLiteLibraryVersion) VALUES (?1, ?2)",
            rusqlite::params![env!("CARGO_PKG_VERSION"), rusqlite::version()],
        )?;
    }

    Ok(())
}
