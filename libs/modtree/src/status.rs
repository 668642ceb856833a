//! Per-group status records and the compact summary produced from them.
//!
//! Every group operation (load services, start components, ...) yields one
//! [`StatusRecord`]. A verb on a unit yields a [`PhaseReport`] with one record per
//! kind it drove. [`filter_status`] turns the full tree into something a human can
//! audit: empty groups disappear, errors become strings and children with nothing
//! to report collapse to `true`.

use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{error_chain, LoaderError, ModuleError};
use crate::kind::ModuleKind;

/// Result of one child within a group.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done(PhaseReport),
    Failed(Arc<ModuleError>),
}

impl Outcome {
    /// Partial failures keep their nested report so the structure stays visible.
    pub fn from_result(res: Result<PhaseReport, ModuleError>) -> Self {
        match res {
            Ok(report) => Outcome::Done(report),
            Err(e) => match e.report().cloned() {
                Some(report) => Outcome::Done(report),
                None => Outcome::Failed(Arc::new(e)),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            Outcome::Done(r) => r.has_failures(),
            Outcome::Failed(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Status {
    /// No children of this kind.
    Empty,
    /// Child name -> outcome, in the order the children were driven.
    Entries(IndexMap<String, Outcome>),
    /// The group as a whole could not run.
    Error(Arc<LoaderError>),
}

#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub kind: ModuleKind,
    pub status: Status,
}

impl StatusRecord {
    pub fn empty(kind: ModuleKind) -> Self {
        Self {
            kind,
            status: Status::Empty,
        }
    }

    pub fn entries(kind: ModuleKind, entries: IndexMap<String, Outcome>) -> Self {
        if entries.is_empty() {
            return Self::empty(kind);
        }
        Self {
            kind,
            status: Status::Entries(entries),
        }
    }

    pub fn error(kind: ModuleKind, err: LoaderError) -> Self {
        Self {
            kind,
            status: Status::Error(Arc::new(err)),
        }
    }

    pub fn is_failure(&self) -> bool {
        match &self.status {
            Status::Empty => false,
            Status::Entries(m) => m.values().any(Outcome::is_failure),
            Status::Error(_) => true,
        }
    }
}

/// Everything one verb on one unit reports about its children.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub records: Vec<StatusRecord>,
}

impl PhaseReport {
    pub fn new(records: Vec<StatusRecord>) -> Self {
        Self { records }
    }

    pub fn has_failures(&self) -> bool {
        self.records.iter().any(StatusRecord::is_failure)
    }

    pub fn summary(&self) -> Vec<FilteredRecord> {
        filter_status(&self.records)
    }

    pub fn summary_json(&self) -> String {
        serde_json::to_string(&self.summary()).unwrap_or_else(|_| "[]".to_string())
    }
}

// ----- Filtered view ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Summary {
    /// Nothing left to report for this child.
    Ok(bool),
    Error(String),
    Nested(Vec<FilteredRecord>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilteredStatus {
    Error(String),
    Entries(IndexMap<String, Summary>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredRecord {
    pub kind: ModuleKind,
    pub status: FilteredStatus,
}

/// Drop empty records, stringify errors, collapse children with nothing to report
/// to `true`.
pub fn filter_status(records: &[StatusRecord]) -> Vec<FilteredRecord> {
    records
        .iter()
        .filter_map(|rec| {
            let status = match &rec.status {
                Status::Empty => return None,
                Status::Error(e) => FilteredStatus::Error(error_chain(e.as_ref())),
                Status::Entries(entries) => FilteredStatus::Entries(
                    entries
                        .iter()
                        .map(|(name, outcome)| (name.clone(), summarize(outcome)))
                        .collect(),
                ),
            };
            Some(FilteredRecord {
                kind: rec.kind,
                status,
            })
        })
        .collect()
}

fn summarize(outcome: &Outcome) -> Summary {
    match outcome {
        Outcome::Failed(e) => Summary::Error(error_chain(e.as_ref())),
        Outcome::Done(report) => {
            let nested = filter_status(&report.records);
            if nested.is_empty() {
                Summary::Ok(true)
            } else {
                Summary::Nested(nested)
            }
        }
    }
}
