//! DedupIndex — cross-shard content-hash search.
//!
//! There is no global hash index; the search fans out over every period the
//! router can discover and queries each shard's `Hash` index. Only live
//! heads (`RecStatus = 'NEW'`) count: a superseded or deleted row with the
//! same content is not a duplicate.

use rusqlite::params;
use serde::Serialize;
use tracing::warn;

use crate::chain::deal_from_row;
use crate::deal::Deal;
use crate::error::Result;
use crate::router::{ShardHandle, ShardRouter};

/// A dedup hit, tagged with the period that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub no: String,
    pub period: String,
    pub deal_date: String,
    pub deal_partner: String,
    pub deal_price: i64,
}

impl DuplicateMatch {
    fn from_deal(deal: &Deal, period: &str) -> Self {
        DuplicateMatch {
            no: deal.no.clone(),
            period: period.to_string(),
            deal_date: deal.deal_date.clone(),
            deal_partner: deal.deal_partner.clone(),
            deal_price: deal.deal_price,
        }
    }
}

/// Live heads in one shard whose stored hash equals `hash`.
pub fn find_in_shard(handle: &ShardHandle, hash: &str) -> Result<Vec<Deal>> {
    if hash.is_empty() {
        return Ok(Vec::new());
    }

    let conn = handle.conn();
    let mut stmt = conn.prepare(
        "SELECT NO, nextNO, prevNO, DealType, DealDate, DealName, DealPartner, \
         DealPrice, DealRemark, RecUpdate, RegDate, RecStatus, FilePath, Hash \
         FROM Deals WHERE Hash = ?1 AND RecStatus = 'NEW'",
    )?;
    let deals = stmt
        .query_map(params![hash], deal_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(deals)
}

/// Search every known period for live heads with this content hash.
///
/// A shard that fails to open is skipped with a warning; one bad period
/// must not block uploads everywhere else.
pub fn find_by_hash(router: &ShardRouter, hash: &str) -> Result<Vec<DuplicateMatch>> {
    if hash.is_empty() {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    for period in router.list_known()? {
        let handle = match router.connect_existing(&period) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(period = %period, error = %e, "skipping unreadable shard in dedup scan");
                continue;
            }
        };
        match find_in_shard(&handle, hash) {
            Ok(deals) => {
                matches.extend(deals.iter().map(|d| DuplicateMatch::from_deal(d, &period)));
            }
            Err(e) => {
                warn!(period = %period, error = %e, "dedup query failed, skipping period");
            }
        }
    }
    Ok(matches)
}
