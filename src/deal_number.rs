//! Deal number generation and the lineage-id grammar.
//!
//! Grammar: `base := [^-]+ (anything without a trailing numeric suffix)`,
//! `number := base ('-' digits)?`. The trailing `-N` suffix is used by two
//! distinct schemes that share syntax:
//!
//! - sequence suffix, zero-padded two digits (`-01`), assigned at create
//!   time to dodge a number collision;
//! - branch suffix, unpadded (`-1`), assigned at supersede time to number
//!   the next edit of a confirmed head.
//!
//! The parser cannot tell them apart; `LineageId` treats any trailing
//! all-digit suffix as a branch. See DESIGN.md for the consequences.

use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Short origin tag appended to generated numbers.
///
/// Derived from the caller's network identity — the last octet of an IPv4
/// address, zero-padded (`192.168.1.105` -> `PC105`). Deterministic and
/// collision-resistant enough for number synthesis; not security-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTag(String);

impl OriginTag {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => OriginTag(format!("PC{:03}", v4.octets()[3])),
            IpAddr::V6(_) => OriginTag::fallback(),
        }
    }

    /// Tag used when no caller identity is available.
    pub fn fallback() -> Self {
        OriginTag("PC000".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OriginTag {
    fn default() -> Self {
        OriginTag::fallback()
    }
}

/// Synthesize a fresh deal number: `YYYYMMDDHHMMSS` + origin tag.
pub fn generate(origin: &OriginTag, now: DateTime<Utc>) -> String {
    format!("{}{}", now.format("%Y%m%d%H%M%S"), origin.as_str())
}

/// A deal number split into its base and optional numeric suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageId {
    base: String,
    branch: Option<u32>,
}

impl LineageId {
    /// Parse a deal number. Only a trailing *purely numeric* suffix after
    /// the last `-` counts as a branch; anything else is part of the base.
    pub fn parse(no: &str) -> Self {
        if let Some(idx) = no.rfind('-') {
            let suffix = &no[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = suffix.parse::<u32>() {
                    return LineageId {
                        base: no[..idx].to_string(),
                        branch: Some(n),
                    };
                }
            }
        }
        LineageId {
            base: no.to_string(),
            branch: None,
        }
    }

    /// Lineage base identifier shared by all versions of one logical deal.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn branch(&self) -> Option<u32> {
        self.branch
    }
}

/// Next edit-branch number for a confirmed head.
///
/// `D1 -> D1-1`, `D1-1 -> D1-2`.
pub fn next_branch(no: &str) -> String {
    let id = LineageId::parse(no);
    match id.branch() {
        Some(n) => format!("{}-{}", id.base(), n + 1),
        None => format!("{no}-1"),
    }
}

/// Next collision-avoidance sequence number.
///
/// `N -> N-01`, `N-01 -> N-02`. Two-digit zero padding, matching the
/// numbers handed out at create time.
pub fn next_sequence(no: &str) -> String {
    let id = LineageId::parse(no);
    match id.branch() {
        Some(n) => format!("{}-{:02}", id.base(), n + 1),
        None => format!("{no}-01"),
    }
}
