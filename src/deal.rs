//! Deal records and the version-chain lifecycle flag.
//!
//! A deal row is immutable once written except for two fields: `rec_status`
//! and `next_no` (plus the `rec_update` stamp), which are flipped when the
//! row is superseded or logically deleted. Rows are never physically removed
//! except by deleting the whole shard directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Lifecycle flag on a deal row.
///
/// Transitions: `New -> Updated` (supersede, paired with inserting the
/// successor row), `New -> Deleted` and `Updated -> Deleted` (logical
/// delete). `Updated` rows are never the target of a delete on their own;
/// deletion always addresses the lineage head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecStatus {
    New,
    Updated,
    Deleted,
}

impl RecStatus {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecStatus::New => "NEW",
            RecStatus::Updated => "UPDATE",
            RecStatus::Deleted => "DELETE",
        }
    }

    /// Parse a stored column value.
    pub fn from_db(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(RecStatus::New),
            "UPDATE" => Ok(RecStatus::Updated),
            "DELETE" => Ok(RecStatus::Deleted),
            other => Err(StoreError::Validation(format!(
                "unknown RecStatus value: {other}"
            ))),
        }
    }
}

/// One version of a deal, as stored in a shard's `Deals` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    /// Unique within the shard; primary key.
    pub no: String,
    /// Forward pointer to the superseding version. `None` on heads.
    pub next_no: Option<String>,
    /// Back pointer to the superseded version. `None` on originals.
    pub prev_no: Option<String>,
    pub deal_type: String,
    pub deal_date: String,
    pub deal_name: String,
    pub deal_partner: String,
    pub deal_price: i64,
    pub deal_remark: String,
    /// Last mutation timestamp.
    pub rec_update: String,
    /// Creation timestamp.
    pub reg_date: String,
    pub rec_status: RecStatus,
    /// Attachment file name inside the owning period's directory.
    pub file_path: Option<String>,
    /// SHA-256 of the attachment content.
    pub hash: Option<String>,
}

impl Deal {
    /// True if this row is a lineage head (latest version, live or deleted).
    pub fn is_head(&self) -> bool {
        self.next_no.is_none() && matches!(self.rec_status, RecStatus::New | RecStatus::Deleted)
    }
}

/// Caller-supplied descriptive fields for a new deal or revision.
///
/// Numbers, pointers, status and timestamps are always assigned by the
/// store; a draft carries only what the caller is trusted with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealDraft {
    pub deal_type: String,
    pub deal_date: String,
    pub deal_name: String,
    pub deal_partner: String,
    pub deal_price: i64,
    pub deal_remark: String,
}

/// Filter for flat and history list views.
#[derive(Debug, Clone, Default)]
pub struct DealFilter {
    /// Inclusive lower bound on `DealDate`.
    pub from_date: Option<String>,
    /// Inclusive upper bound on `DealDate`.
    pub to_date: Option<String>,
    /// Substring match on `DealPartner`.
    pub partner: Option<String>,
    /// Exact match on `DealType`.
    pub deal_type: Option<String>,
    /// Substring match on name, remark, or partner.
    pub keyword: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A head deal annotated with its full lineage, for audit views.
#[derive(Debug, Clone, Serialize)]
pub struct DealWithHistory {
    #[serde(flatten)]
    pub deal: Deal,
    /// Lineage base identifier (head number with any branch suffix stripped).
    pub base_no: String,
    pub child_count: usize,
    pub children: Vec<Deal>,
}

/// A head row tagged with the period that owns it, for cross-period views.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodDeal {
    pub period: String,
    #[serde(flatten)]
    pub deal: Deal,
}

/// A history-annotated head tagged with its owning period.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodDealWithHistory {
    pub period: String,
    #[serde(flatten)]
    pub entry: DealWithHistory,
}

/// Current timestamp in the stored format (`YYYY-MM-DDTHH:MM:SSZ`, UTC).
pub(crate) fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
