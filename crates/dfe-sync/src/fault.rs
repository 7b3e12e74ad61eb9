//! The two failure scopes of a sync pass.
//!
//! [`EntryFault`] drops one entry and the batch continues. [`AccountFault`]
//! aborts the account for the current pass with its watermark untouched.
//! They are separate types so neither can be passed where the other is
//! expected.

use std::fmt;

use dfe_classify::EntryError;
use dfe_schemas::Nsu;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFault {
    /// Entry could not be decoded or classified.
    Skip { nsu: Option<Nsu>, reason: String },
}

impl EntryFault {
    pub fn from_entry(nsu: Nsu, err: &EntryError) -> Self {
        EntryFault::Skip {
            nsu: Some(nsu),
            reason: err.to_string(),
        }
    }

    /// Entry rejected while reading the response (no usable NSU).
    pub fn unreadable(reason: impl Into<String>) -> Self {
        EntryFault::Skip {
            nsu: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EntryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryFault::Skip {
                nsu: Some(nsu),
                reason,
            } => write!(f, "skipped entry {nsu}: {reason}"),
            EntryFault::Skip { nsu: None, reason } => write!(f, "skipped entry: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountFault {
    /// Stop this account for the current pass. `stage` names the step that
    /// failed (`query`, `persist`, `watermark`).
    Fatal { stage: &'static str, reason: String },
}

impl AccountFault {
    pub fn fatal(stage: &'static str, reason: impl fmt::Display) -> Self {
        AccountFault::Fatal {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            AccountFault::Fatal { stage, .. } => stage,
        }
    }
}

impl fmt::Display for AccountFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountFault::Fatal { stage, reason } => write!(f, "{stage} failed: {reason}"),
        }
    }
}

impl std::error::Error for AccountFault {}
