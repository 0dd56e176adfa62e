//! dealvault — a multi-period deal ledger.
//!
//! Deals are grouped into accounting periods, each period owning its own
//! directory with one SQLite shard and the attached documents inside.
//! Records are append-only: an edit supersedes the old version and links
//! them into a chain, a delete flips a status flag, and nothing is ever
//! physically removed short of deleting a whole period.
//!
//! Layering, bottom up:
//!
//! - [`router`] — opens and pools the per-period shards plus the system db;
//! - [`schema`] / [`deal`] / [`deal_number`] — storage shape, record types,
//!   and the number grammar;
//! - [`chain`] / [`history`] — the create/supersede/delete state machine and
//!   lineage reconstruction;
//! - [`dedup`] / [`attachment`] — content hashing and document storage;
//! - [`mover`] — the cross-period move saga;
//! - [`store`] — the facade most callers want.

pub mod attachment;
pub mod chain;
pub mod config;
pub mod deal;
pub mod deal_number;
pub mod dedup;
pub mod error;
pub mod history;
pub mod mover;
pub mod partner;
pub mod period;
pub mod router;
pub mod schema;
pub mod store;

pub use config::StoreConfig;
pub use deal::{
    Deal, DealDraft, DealFilter, DealWithHistory, PeriodDeal, PeriodDealWithHistory, RecStatus,
};
pub use deal_number::OriginTag;
pub use dedup::DuplicateMatch;
pub use error::{Result, StoreError};
pub use mover::{MoveOutcome, MoveReport};
pub use period::PeriodInfo;
pub use router::{ShardHandle, ShardRouter};
pub use store::{AttachmentData, DealStore, FileUpload, RegisterReceipt};
