//! Sync engine errors.

use branchsync_core::errors::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Machine-readable code carried by insert-only rejections.
pub const INSERT_ONLY_VIOLATION: &str = "INSERT_ONLY_VIOLATION";

/// Why an incoming snapshot was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationReason {
    /// `incoming.version < current.version`.
    VersionRegression,
    /// A declared table is absent.
    MissingTable,
    /// A table value is not an array.
    InvalidTableFormat,
    /// A row lacks a primary-key field.
    MissingPrimaryKey,
    /// Two rows share a composite key.
    DuplicatePrimaryKey,
}

impl ViolationReason {
    /// Wire name of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionRegression => "version-regression",
            Self::MissingTable => "missing-table",
            Self::InvalidTableFormat => "invalid-table-format",
            Self::MissingPrimaryKey => "missing-primary-key",
            Self::DuplicatePrimaryKey => "duplicate-primary-key",
        }
    }
}

/// Structured detail of an insert-only rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Rejection reason.
    pub reason: ViolationReason,
    /// Offending table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Offending row index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Offending composite key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Version held by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    /// Version the client sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_version: Option<u64>,
    /// Row count of the missing table on the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_count: Option<usize>,
    /// Branch of the rejected apply.
    pub branch_id: String,
    /// Module of the rejected apply.
    pub module_id: String,
}

impl Violation {
    /// A violation with only the reason and scope set.
    pub fn new(reason: ViolationReason, branch_id: &str, module_id: &str) -> Self {
        Self {
            reason,
            table_name: None,
            index: None,
            key: None,
            current_version: None,
            incoming_version: None,
            current_count: None,
            branch_id: branch_id.to_owned(),
            module_id: module_id.to_owned(),
        }
    }

    /// Attach the offending table.
    #[must_use]
    pub fn table(mut self, table: &str) -> Self {
        self.table_name = Some(table.to_owned());
        self
    }
}

/// Failures of the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The incoming snapshot breaks the insert-only policy.
    #[error("Incoming snapshot violates insert-only policy.")]
    InsertOnlyViolation(Box<Violation>),
    /// The incoming snapshot is not a snapshot at all.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    /// The storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Stable code for logs and error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsertOnlyViolation(_) => INSERT_ONLY_VIOLATION,
            Self::InvalidSnapshot(_) => "INVALID_SNAPSHOT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// The violation detail, for insert-only rejections.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::InsertOnlyViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Violation> for SyncError {
    fn from(v: Violation) -> Self {
        Self::InsertOnlyViolation(Box::new(v))
    }
}
