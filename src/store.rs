//! DealStore — the public facade over the router, chains and dedup scan.
//!
//! Operations here compose the lower layers in the order that keeps the
//! store consistent when a step fails: duplicate detection runs before any
//! file lands on disk, files land before their database row, and every
//! failed row insert removes the file it would have referenced.

use tracing::{info, warn};

use crate::attachment::{self, MAX_UPLOAD_BYTES};
use crate::chain;
use crate::config::StoreConfig;
use crate::deal::{Deal, DealDraft, DealFilter, DealWithHistory, PeriodDeal, PeriodDealWithHistory};
use crate::deal_number::{self, OriginTag};
use crate::dedup::{self, DuplicateMatch};
use crate::error::{Result, StoreError};
use crate::history;
use crate::mover::{self, MoveOutcome};
use crate::partner;
use crate::period::{self, PeriodInfo};
use crate::router::ShardRouter;

/// An uploaded document. The original name only contributes its extension;
/// the stored name is always regenerated from the deal's attributes.
pub struct FileUpload<'a> {
    pub original_name: &'a str,
    pub bytes: &'a [u8],
}

/// Outcome of a successful register or revise.
#[derive(Debug)]
pub struct RegisterReceipt {
    pub deal: Deal,
    /// Duplicate matches the caller chose to override. Empty unless the
    /// registration was forced past the dedup gate.
    pub duplicate_warnings: Vec<DuplicateMatch>,
}

/// An attachment read back from a period directory.
#[derive(Debug)]
pub struct AttachmentData {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub modified: std::time::SystemTime,
}

pub struct DealStore {
    router: ShardRouter,
    origin: OriginTag,
}

impl DealStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_origin(config, OriginTag::default())
    }

    /// Open with an explicit origin tag for number synthesis (derived from
    /// the caller's address in a served deployment).
    pub fn open_with_origin(config: StoreConfig, origin: OriginTag) -> Result<Self> {
        Ok(DealStore {
            router: ShardRouter::open(config)?,
            origin,
        })
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    // ── Deals ──────────────────────────────────────────────────────────

    /// Register a new deal, optionally with an attached document.
    ///
    /// The dedup gate runs before anything touches disk: if the upload's
    /// content hash matches a live head in any period, the registration is
    /// refused with the full match list unless `allow_duplicate` is set, in
    /// which case the matches come back as warnings on the receipt.
    pub fn register(
        &self,
        period: &str,
        draft: &DealDraft,
        file: Option<FileUpload<'_>>,
        allow_duplicate: bool,
    ) -> Result<RegisterReceipt> {
        validate_draft(draft)?;

        let handle = self.router.connect(period)?;
        let no = chain::allocate_number(&handle, &self.origin)?;

        let mut warnings = Vec::new();
        let mut file_path = None;
        let mut hash = None;

        if let Some(file) = file {
            if file.bytes.len() > MAX_UPLOAD_BYTES {
                return Err(StoreError::Validation(format!(
                    "file exceeds the {MAX_UPLOAD_BYTES} byte upload limit"
                )));
            }

            let content_hash = attachment::content_hash(file.bytes);
            let matches = dedup::find_by_hash(&self.router, &content_hash)?;
            if !matches.is_empty() {
                if !allow_duplicate {
                    return Err(StoreError::DuplicateFile { matches });
                }
                warnings = matches;
            }

            let name = attachment::attachment_file_name(
                &no,
                &draft.deal_date,
                &draft.deal_partner,
                draft.deal_price,
                &attachment::extension_of(file.original_name),
            );
            attachment::write_atomic(&handle.dir().join(&name), file.bytes)?;
            file_path = Some(name);
            hash = Some(content_hash);
        }

        let deal = match chain::create(&handle, &no, draft, file_path.clone(), hash) {
            Ok(deal) => deal,
            Err(e) => {
                if let Some(name) = &file_path {
                    let _ = std::fs::remove_file(handle.dir().join(name));
                }
                return Err(e);
            }
        };

        info!(period, no = %deal.no, forced = !warnings.is_empty(), "deal registered");
        Ok(RegisterReceipt {
            deal,
            duplicate_warnings: warnings,
        })
    }

    /// Supersede a deal's head with edited attributes, and optionally a
    /// replacement document.
    ///
    /// Without a new file the old head's attachment is carried over: copied
    /// under the successor's canonical name with its timestamp preserved,
    /// so each version keeps the document it was confirmed with.
    pub fn revise(
        &self,
        period: &str,
        old_no: &str,
        draft: &DealDraft,
        file: Option<FileUpload<'_>>,
        allow_duplicate: bool,
    ) -> Result<RegisterReceipt> {
        validate_draft(draft)?;

        let handle = self.router.connect_existing(period)?;
        let old = chain::get(&handle, old_no)?;

        let mut new_no = deal_number::next_branch(old_no);
        while chain::exists(&handle, &new_no)? {
            new_no = deal_number::next_branch(&new_no);
        }

        let mut warnings = Vec::new();
        let mut file_path = None;
        let mut hash = None;

        if let Some(file) = &file {
            if file.bytes.len() > MAX_UPLOAD_BYTES {
                return Err(StoreError::Validation(format!(
                    "file exceeds the {MAX_UPLOAD_BYTES} byte upload limit"
                )));
            }

            let content_hash = attachment::content_hash(file.bytes);
            // The head being revised is not a duplicate of itself.
            let matches: Vec<_> = dedup::find_by_hash(&self.router, &content_hash)?
                .into_iter()
                .filter(|m| !(m.no == old_no && m.period == period))
                .collect();
            if !matches.is_empty() {
                if !allow_duplicate {
                    return Err(StoreError::DuplicateFile { matches });
                }
                warnings = matches;
            }

            let name = attachment::attachment_file_name(
                &new_no,
                &draft.deal_date,
                &draft.deal_partner,
                draft.deal_price,
                &attachment::extension_of(file.original_name),
            );
            attachment::write_atomic(&handle.dir().join(&name), file.bytes)?;
            file_path = Some(name);
            hash = Some(content_hash);
        } else if let Some(old_file) = old.file_path.as_deref() {
            let name = attachment::attachment_file_name(
                &new_no,
                &draft.deal_date,
                &draft.deal_partner,
                draft.deal_price,
                &attachment::extension_of(old_file),
            );
            match attachment::copy_preserving_mtime(
                &handle.dir().join(old_file),
                &handle.dir().join(&name),
            ) {
                Ok(()) => {
                    file_path = Some(name);
                    hash = old.hash.clone();
                }
                Err(e) => {
                    // The row outlives a lost file; the revision proceeds
                    // without one, same as a cross-period move does.
                    warn!(
                        period,
                        no = old_no,
                        error = %e,
                        "previous attachment unreadable, revising without it"
                    );
                }
            }
        }

        let deal = match chain::supersede(&handle, old_no, &new_no, draft, file_path.clone(), hash)
        {
            Ok(deal) => deal,
            Err(e) => {
                if let Some(name) = &file_path {
                    let _ = std::fs::remove_file(handle.dir().join(name));
                }
                return Err(e);
            }
        };

        info!(period, old = old_no, new = %deal.no, "deal revised");
        Ok(RegisterReceipt {
            deal,
            duplicate_warnings: warnings,
        })
    }

    /// Logically delete a deal's head. The row and its attachment remain.
    pub fn remove(&self, period: &str, no: &str) -> Result<()> {
        let handle = self.router.connect_existing(period)?;
        chain::mark_deleted(&handle, no)
    }

    pub fn fetch(&self, period: &str, no: &str) -> Result<Deal> {
        let handle = self.router.connect_existing(period)?;
        chain::get(&handle, no)
    }

    /// Read a deal's attached document from its period directory.
    pub fn read_attachment(&self, period: &str, no: &str) -> Result<AttachmentData> {
        let handle = self.router.connect_existing(period)?;
        let deal = chain::get(&handle, no)?;
        let Some(file_name) = deal.file_path else {
            return Err(StoreError::Validation(format!(
                "deal {no} has no attached file"
            )));
        };
        let (bytes, modified) = attachment::read_with_mtime(&handle.dir().join(&file_name))?;
        Ok(AttachmentData {
            file_name,
            bytes,
            modified,
        })
    }

    pub fn list_flat(&self, period: &str, filter: &DealFilter) -> Result<(Vec<Deal>, u64)> {
        let handle = self.router.connect_existing(period)?;
        chain::list_flat(&handle, filter)
    }

    pub fn list_history(
        &self,
        period: &str,
        filter: &DealFilter,
    ) -> Result<(Vec<DealWithHistory>, u64)> {
        let handle = self.router.connect_existing(period)?;
        history::list_with_history(&handle, filter)
    }

    /// Flat view over many periods at once: every known period, or a
    /// caller-selected subset. Shards that fail to open (or query) are
    /// skipped with a warning, same as the dedup scan; one bad period must
    /// not blank the whole listing. Rows come back tagged with their owning
    /// period, globally ordered `DealDate DESC, NO DESC`, with the summed
    /// unpaginated total.
    pub fn list_all_flat(
        &self,
        periods: Option<&[String]>,
        filter: &DealFilter,
    ) -> Result<(Vec<PeriodDeal>, u64)> {
        let mut out = Vec::new();
        let mut total = 0u64;
        for period in self.select_periods(periods)? {
            let Some(handle) = self.open_for_listing(&period) else {
                continue;
            };
            match chain::list_flat(&handle, filter) {
                Ok((deals, count)) => {
                    total += count;
                    out.extend(deals.into_iter().map(|deal| PeriodDeal {
                        period: period.clone(),
                        deal,
                    }));
                }
                Err(e) => {
                    warn!(period = %period, error = %e, "listing query failed, skipping period");
                }
            }
        }
        out.sort_by(|a, b| {
            b.deal
                .deal_date
                .cmp(&a.deal.deal_date)
                .then_with(|| b.deal.no.cmp(&a.deal.no))
        });
        Ok((out, total))
    }

    /// History view over many periods, ordered by last mutation.
    pub fn list_all_history(
        &self,
        periods: Option<&[String]>,
        filter: &DealFilter,
    ) -> Result<(Vec<PeriodDealWithHistory>, u64)> {
        let mut out = Vec::new();
        let mut total = 0u64;
        for period in self.select_periods(periods)? {
            let Some(handle) = self.open_for_listing(&period) else {
                continue;
            };
            match history::list_with_history(&handle, filter) {
                Ok((rows, count)) => {
                    total += count;
                    out.extend(rows.into_iter().map(|entry| PeriodDealWithHistory {
                        period: period.clone(),
                        entry,
                    }));
                }
                Err(e) => {
                    warn!(period = %period, error = %e, "history query failed, skipping period");
                }
            }
        }
        out.sort_by(|a, b| {
            b.entry
                .deal
                .rec_update
                .cmp(&a.entry.deal.rec_update)
                .then_with(|| b.entry.deal.no.cmp(&a.entry.deal.no))
        });
        Ok((out, total))
    }

    fn select_periods(&self, periods: Option<&[String]>) -> Result<Vec<String>> {
        match periods {
            Some(list) => Ok(list.to_vec()),
            None => self.router.list_known(),
        }
    }

    fn open_for_listing(&self, period: &str) -> Option<std::sync::Arc<crate::router::ShardHandle>> {
        match self.router.connect_existing(period) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(period = %period, error = %e, "skipping unreadable shard in cross-period listing");
                None
            }
        }
    }

    /// Historical versions of the lineage `no` heads, newest first.
    pub fn history_of(&self, period: &str, no: &str) -> Result<Vec<Deal>> {
        let handle = self.router.connect_existing(period)?;
        history::assemble(&handle, no)
    }

    /// Move a deal head (and attachment) into another period.
    pub fn move_deal(&self, no: &str, from_period: &str, to_period: &str) -> Result<MoveOutcome> {
        mover::move_deal(&self.router, &self.origin, no, from_period, to_period)
    }

    /// Live heads across all periods matching this content.
    pub fn find_duplicates(&self, bytes: &[u8]) -> Result<Vec<DuplicateMatch>> {
        dedup::find_by_hash(&self.router, &attachment::content_hash(bytes))
    }

    // ── Partners ───────────────────────────────────────────────────────

    pub fn partners(&self) -> Result<Vec<String>> {
        partner::list_partners(&self.router)
    }

    pub fn add_partner(&self, name: &str) -> Result<()> {
        partner::add_partner(&self.router, name)
    }

    pub fn rename_partner(&self, old: &str, new: &str) -> Result<()> {
        partner::rename_partner(&self.router, old, new)
    }

    pub fn delete_partner(&self, name: &str) -> Result<()> {
        partner::delete_partner(&self.router, name)
    }

    // ── Periods ────────────────────────────────────────────────────────

    pub fn periods(&self) -> Result<Vec<PeriodInfo>> {
        period::list_with_details(&self.router)
    }

    pub fn period_info(&self, name: &str) -> Result<PeriodInfo> {
        period::get_period(&self.router, name)
    }

    pub fn create_period(&self, name: &str, from_date: &str, to_date: &str) -> Result<PeriodInfo> {
        period::create_period(&self.router, name, from_date, to_date)
    }

    pub fn set_period_dates(&self, name: &str, from_date: &str, to_date: &str) -> Result<()> {
        period::update_period_dates(&self.router, name, from_date, to_date)
    }

    pub fn rename_period(&self, old: &str, new: &str) -> Result<()> {
        period::rename_period(&self.router, old, new)
    }

    pub fn delete_period(&self, name: &str) -> Result<()> {
        period::delete_period(&self.router, name)
    }
}

fn validate_draft(draft: &DealDraft) -> Result<()> {
    if draft.deal_partner.trim().is_empty() {
        return Err(StoreError::Validation(
            "deal partner is required".to_string(),
        ));
    }
    chrono::NaiveDate::parse_from_str(&draft.deal_date, "%Y-%m-%d").map_err(|_| {
        StoreError::Validation(format!(
            "deal date must be YYYY-MM-DD: '{}'",
            draft.deal_date
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, DealStore) {
        let dir = tempdir().unwrap();
        let store = DealStore::open(StoreConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    fn draft(partner: &str, price: i64) -> DealDraft {
        DealDraft {
            deal_type: "invoice".into(),
            deal_date: "2024-01-15".into(),
            deal_name: "supplies".into(),
            deal_partner: partner.into(),
            deal_price: price,
            deal_remark: String::new(),
        }
    }

    #[test]
    fn register_without_file_has_no_hash() {
        let (_dir, store) = store();

        let receipt = store
            .register("2024-01", &draft("Acme", 1000), None, false)
            .unwrap();
        assert!(receipt.deal.file_path.is_none());
        assert!(receipt.deal.hash.is_none());
        assert!(receipt.duplicate_warnings.is_empty());
    }

    #[test]
    fn register_validates_draft_fields() {
        let (_dir, store) = store();

        let err = store
            .register("2024-01", &draft("", 1000), None, false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let mut bad_date = draft("Acme", 1000);
        bad_date.deal_date = "15/01/2024".into();
        let err = store
            .register("2024-01", &bad_date, None, false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn register_stores_file_under_canonical_name() {
        let (_dir, store) = store();

        let receipt = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "scan 1.pdf",
                    bytes: b"content",
                }),
                false,
            )
            .unwrap();

        let name = receipt.deal.file_path.as_deref().unwrap();
        assert!(name.starts_with(&receipt.deal.no));
        assert!(name.ends_with("_2024-01-15_Acme_1000.pdf"));

        let handle = store.router().connect_existing("2024-01").unwrap();
        assert_eq!(
            std::fs::read(handle.dir().join(name)).unwrap(),
            b"content"
        );
        assert_eq!(
            receipt.deal.hash.as_deref().unwrap(),
            attachment::content_hash(b"content")
        );
    }

    #[test]
    fn register_rejects_oversized_upload() {
        let (_dir, store) = store();

        let bytes = vec![0u8; MAX_UPLOAD_BYTES + 1];
        let err = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "big.bin",
                    bytes: &bytes,
                }),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn revise_carries_old_attachment_forward() {
        let (_dir, store) = store();

        let receipt = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "scan.pdf",
                    bytes: b"original scan",
                }),
                false,
            )
            .unwrap();
        let old_no = receipt.deal.no.clone();

        let revised = store
            .revise("2024-01", &old_no, &draft("Acme", 1200), None, false)
            .unwrap();

        assert_eq!(revised.deal.prev_no.as_deref(), Some(old_no.as_str()));
        assert_eq!(revised.deal.hash, receipt.deal.hash);

        // Both versions keep their own copy on disk.
        let handle = store.router().connect_existing("2024-01").unwrap();
        let old_file = handle.dir().join(receipt.deal.file_path.unwrap());
        let new_file = handle.dir().join(revised.deal.file_path.unwrap());
        assert_eq!(std::fs::read(old_file).unwrap(), b"original scan");
        assert_eq!(std::fs::read(new_file).unwrap(), b"original scan");
    }

    #[test]
    fn revise_survives_missing_old_attachment() {
        let (_dir, store) = store();

        let receipt = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "scan.pdf",
                    bytes: b"original scan",
                }),
                false,
            )
            .unwrap();

        // Lose the stored file out from under the row.
        let handle = store.router().connect_existing("2024-01").unwrap();
        std::fs::remove_file(handle.dir().join(receipt.deal.file_path.as_deref().unwrap()))
            .unwrap();

        let revised = store
            .revise("2024-01", &receipt.deal.no, &draft("Acme", 1200), None, false)
            .unwrap();

        // The revision lands, just without a carried-over document.
        assert!(revised.deal.file_path.is_none());
        assert!(revised.deal.hash.is_none());
        let old = store.fetch("2024-01", &receipt.deal.no).unwrap();
        assert_eq!(old.rec_status, crate::deal::RecStatus::Updated);
    }

    #[test]
    fn revise_with_replacement_file_is_not_its_own_duplicate() {
        let (_dir, store) = store();

        let receipt = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "scan.pdf",
                    bytes: b"same content",
                }),
                false,
            )
            .unwrap();

        // Re-submitting the head's own content must pass the gate.
        let revised = store
            .revise(
                "2024-01",
                &receipt.deal.no,
                &draft("Acme", 1100),
                Some(FileUpload {
                    original_name: "scan.pdf",
                    bytes: b"same content",
                }),
                false,
            )
            .unwrap();
        assert!(revised.duplicate_warnings.is_empty());
    }

    #[test]
    fn revise_skips_occupied_branch_numbers() {
        let (_dir, store) = store();
        let handle = store.router().connect("2024-01").unwrap();
        chain::create(&handle, "D1", &draft("Acme", 1000), None, None).unwrap();
        // Squat on the next branch number with an unrelated row.
        chain::create(&handle, "D1-1", &draft("Squat", 1), None, None).unwrap();

        let revised = store
            .revise("2024-01", "D1", &draft("Acme", 1200), None, false)
            .unwrap();
        assert_eq!(revised.deal.no, "D1-2");
    }

    #[test]
    fn read_attachment_round_trip() {
        let (_dir, store) = store();

        let receipt = store
            .register(
                "2024-01",
                &draft("Acme", 1000),
                Some(FileUpload {
                    original_name: "scan.pdf",
                    bytes: b"payload",
                }),
                false,
            )
            .unwrap();

        let data = store.read_attachment("2024-01", &receipt.deal.no).unwrap();
        assert_eq!(data.bytes, b"payload");
        assert_eq!(Some(data.file_name), receipt.deal.file_path);

        let bare = store
            .register("2024-01", &draft("Acme", 500), None, false)
            .unwrap();
        let err = store
            .read_attachment("2024-01", &bare.deal.no)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn remove_and_fetch_use_existing_periods_only() {
        let (_dir, store) = store();

        let err = store.fetch("2099-01", "D1").unwrap_err();
        assert!(matches!(err, StoreError::PeriodNotFound(_)));

        let receipt = store
            .register("2024-01", &draft("Acme", 1000), None, false)
            .unwrap();
        store.remove("2024-01", &receipt.deal.no).unwrap();
        let deal = store.fetch("2024-01", &receipt.deal.no).unwrap();
        assert_eq!(deal.rec_status, crate::deal::RecStatus::Deleted);
    }
}
