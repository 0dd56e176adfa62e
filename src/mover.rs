//! CrossShardMover — moves a deal head between periods as a saga.
//!
//! The two periods are independent SQLite files, so there is no transaction
//! spanning them. The phases are ordered so that the only reachable partial
//! state is "both periods show a live head" — never "neither does":
//!
//! 1. read the source head (no mutation);
//! 2. copy the attachment into the target directory (mtime preserved);
//! 3. insert the new head in the target shard;
//! 4. flip the source row to `DELETE`.
//!
//! Compensation: if phase 3 fails the copied file is removed and the source
//! is untouched — a clean failure. If phase 4 fails after phase 3 committed,
//! the move is still a success but the source stays visible until manual
//! reconciliation; that window is reported as a first-class outcome variant,
//! not just a log line.

use std::fs;

use tracing::{info, warn};

use crate::attachment;
use crate::chain;
use crate::deal::{DealDraft, RecStatus};
use crate::deal_number::{self, OriginTag};
use crate::error::{Result, StoreError};
use crate::router::ShardRouter;

/// What a completed (or partially completed) move did.
#[derive(Debug, Clone)]
pub struct MoveReport {
    pub original_no: String,
    pub new_no: String,
    pub from_period: String,
    pub to_period: String,
    pub file_moved: bool,
}

/// Result of a cross-period move.
#[derive(Debug)]
pub enum MoveOutcome {
    /// All phases committed.
    Completed(MoveReport),
    /// The target insert committed but the source row could not be marked
    /// deleted: the deal is temporarily visible as a live head in both
    /// periods. Requires reconciliation; nothing is rolled back.
    SourceStillVisible { report: MoveReport, reason: String },
}

impl MoveOutcome {
    pub fn report(&self) -> &MoveReport {
        match self {
            MoveOutcome::Completed(report) => report,
            MoveOutcome::SourceStillVisible { report, .. } => report,
        }
    }
}

/// Number for the relocated head. The allocator only checks its own shard,
/// so a move within the same clock second could hand back the source's own
/// number; step the sequence suffix until the number is both free in the
/// target and distinct from the source, with the allocator's retry cap.
fn allocate_target_number(
    target: &crate::router::ShardHandle,
    origin: &OriginTag,
    source_no: &str,
) -> Result<String> {
    allocate_target_number_at(target, origin, source_no, chrono::Utc::now())
}

fn allocate_target_number_at(
    target: &crate::router::ShardHandle,
    origin: &OriginTag,
    source_no: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<String> {
    let mut no = deal_number::generate(origin, now);
    for _ in 0..chain::MAX_SEQUENCE_ATTEMPTS {
        if no != source_no && !chain::exists(target, &no)? {
            return Ok(no);
        }
        no = deal_number::next_sequence(&no);
    }
    Err(StoreError::NumberExists(no))
}

/// Move the head record `deal_no` (and its attachment) from `from_period`
/// into `to_period`.
pub fn move_deal(
    router: &ShardRouter,
    origin: &OriginTag,
    deal_no: &str,
    from_period: &str,
    to_period: &str,
) -> Result<MoveOutcome> {
    if from_period == to_period {
        return Err(StoreError::Validation(
            "source and target periods must be different".to_string(),
        ));
    }

    // Phase 1: read the source head. No mutation yet.
    let source = router.connect_existing(from_period)?;
    let original = chain::get(&source, deal_no)?;
    if original.rec_status != RecStatus::New || original.next_no.is_some() {
        return Err(StoreError::Validation(format!(
            "only the current live head can move between periods: {deal_no}"
        )));
    }

    // Phase 2: prepare the target side.
    let target = router.connect(to_period)?;
    let new_no = allocate_target_number(&target, origin, deal_no)?;

    let mut file_bytes = None;
    if let Some(file_path) = original.file_path.as_deref() {
        let src_path = source.dir().join(file_path);
        match attachment::read_with_mtime(&src_path) {
            Ok(pair) => file_bytes = Some(pair),
            Err(e) => {
                // The row survives a lost file; the move carries on without it.
                warn!(
                    deal = deal_no,
                    path = %src_path.display(),
                    error = %e,
                    "source attachment unreadable, moving deal without it"
                );
            }
        }
    }

    let mut new_file_path = None;
    if let Some((bytes, mtime)) = &file_bytes {
        let ext = attachment::extension_of(original.file_path.as_deref().unwrap_or_default());
        let name = attachment::attachment_file_name(
            &new_no,
            &original.deal_date,
            &original.deal_partner,
            original.deal_price,
            &ext,
        );
        let dst_path = target.dir().join(&name);
        attachment::write_atomic(&dst_path, bytes)?;
        attachment::set_mtime(&dst_path, *mtime)?;
        new_file_path = Some(name);
    }

    // Phase 3: insert the new head in the target shard.
    let draft = DealDraft {
        deal_type: original.deal_type.clone(),
        deal_date: original.deal_date.clone(),
        deal_name: original.deal_name.clone(),
        deal_partner: original.deal_partner.clone(),
        deal_price: original.deal_price,
        deal_remark: original.deal_remark.clone(),
    };
    if let Err(e) = chain::create(
        &target,
        &new_no,
        &draft,
        new_file_path.clone(),
        original.hash.clone(),
    ) {
        // Compensate: remove the copied file; the source row was never touched.
        if let Some(name) = &new_file_path {
            let _ = fs::remove_file(target.dir().join(name));
        }
        return Err(e);
    }

    let report = MoveReport {
        original_no: deal_no.to_string(),
        new_no: new_no.clone(),
        from_period: from_period.to_string(),
        to_period: to_period.to_string(),
        file_moved: new_file_path.is_some(),
    };

    // Phase 4: retire the source row. A failure here is NOT rolled back —
    // the target insert already committed and wins.
    if let Err(e) = chain::mark_deleted(&source, deal_no) {
        warn!(
            deal = deal_no,
            from = from_period,
            to = to_period,
            new = %new_no,
            error = %e,
            "move committed in target but source head was not retired; reconciliation needed"
        );
        return Ok(MoveOutcome::SourceStillVisible {
            report,
            reason: e.to_string(),
        });
    }

    info!(
        deal = deal_no,
        from = from_period,
        to = to_period,
        new = %new_no,
        "deal moved between periods"
    );
    Ok(MoveOutcome::Completed(report))
}
