//! HistoryAssembler — reconstructs the full lineage of a head deal.
//!
//! Lineage membership is by number, not by walking pointers: every version
//! of a logical deal shares a base identifier (the head's number with its
//! branch suffix stripped), so one `NO = base OR NO LIKE 'base-%'` query
//! collects the whole chain. See `deal_number` for the grammar caveat.

use rusqlite::params;

use crate::chain::{self, deal_from_row};
use crate::deal::{Deal, DealFilter, DealWithHistory};
use crate::deal_number::LineageId;
use crate::error::Result;
use crate::router::ShardHandle;

/// All historical versions of the lineage `head_no` belongs to, excluding
/// the head itself, newest mutation first. An empty result means the head
/// has no history — not an error.
pub fn assemble(handle: &ShardHandle, head_no: &str) -> Result<Vec<Deal>> {
    let base = LineageId::parse(head_no).base().to_string();

    let conn = handle.conn();
    let mut stmt = conn.prepare(
        "SELECT NO, nextNO, prevNO, DealType, DealDate, DealName, DealPartner, \
         DealPrice, DealRemark, RecUpdate, RegDate, RecStatus, FilePath, Hash \
         FROM Deals \
         WHERE (NO = ?1 OR NO LIKE ?2) AND NO != ?3 \
         ORDER BY RecUpdate DESC",
    )?;
    let children = stmt
        .query_map(
            params![base, format!("{base}-%"), head_no],
            deal_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(children)
}

/// History view: head rows (same filter as the flat view, ordered by last
/// mutation), each annotated with its full lineage.
pub fn list_with_history(
    handle: &ShardHandle,
    filter: &DealFilter,
) -> Result<(Vec<DealWithHistory>, u64)> {
    let (heads, total) = chain::list_heads_by_update(handle, filter)?;

    let mut out = Vec::with_capacity(heads.len());
    for head in heads {
        let base_no = LineageId::parse(&head.no).base().to_string();
        let children = assemble(handle, &head.no)?;
        out.push(DealWithHistory {
            base_no,
            child_count: children.len(),
            children,
            deal: head,
        });
    }

    Ok((out, total))
}
