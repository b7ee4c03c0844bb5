use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a balance change recorded in the credit ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_entry_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Grant,
    Consume,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Grant => "grant",
            LedgerEntryKind::Consume => "consume",
        }
    }

    /// Sign applied to the ledger amount for this kind.
    pub fn sign(&self) -> i64 {
        match self {
            LedgerEntryKind::Grant => 1,
            LedgerEntryKind::Consume => -1,
        }
    }
}

impl fmt::Display for LedgerEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grant" => Ok(LedgerEntryKind::Grant),
            "consume" => Ok(LedgerEntryKind::Consume),
            _ => Err(format!("Invalid ledger entry kind: {}", s)),
        }
    }
}
