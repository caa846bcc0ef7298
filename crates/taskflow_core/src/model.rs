use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One page recognized as a task, normalized into structured fields.
///
/// `id` is the page id assigned by the wiki service; it is stable across
/// snapshot refreshes and is the join key for every merge operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub assigned_to: Option<String>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub project_stem: Option<String>,
    pub parent_task: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub high_priority: bool,
}

/// Closed set of mergeable field identifiers.
///
/// Only these fields participate in baseline tracking and conflict
/// detection; dates, stem, and tags are re-derived from page text on every
/// ingest and never merged field-by-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Status,
    Stage,
    AssignedTo,
}

impl TaskField {
    pub const ALL: [Self; 3] = [Self::Status, Self::Stage, Self::AssignedTo];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stage => "stage",
            Self::AssignedTo => "assigned_to",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "status" => Some(Self::Status),
            "stage" => Some(Self::Stage),
            "assigned_to" | "assignee" => Some(Self::AssignedTo),
            _ => None,
        }
    }
}

impl Task {
    pub fn field(&self, field: TaskField) -> Option<&str> {
        match field {
            TaskField::Status => self.status.as_deref(),
            TaskField::Stage => self.stage.as_deref(),
            TaskField::AssignedTo => self.assigned_to.as_deref(),
        }
    }

    pub fn set_field(&mut self, field: TaskField, value: Option<String>) {
        match field {
            TaskField::Status => self.status = value,
            TaskField::Stage => self.stage = value,
            TaskField::AssignedTo => self.assigned_to = value,
        }
    }
}

/// One raw page from a project snapshot. Lines arrive either as plain
/// strings (export files) or as objects with a `text` member (backup and
/// page APIs); both decode to the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPage {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub lines: Vec<SnapshotLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotLine {
    Text(String),
    Rich {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated: Option<i64>,
    },
}

impl SnapshotLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Rich { text, .. } => text,
        }
    }
}

impl SnapshotPage {
    /// Page body as one string, the unit all marker scanning runs over.
    pub fn content(&self) -> String {
        self.lines
            .iter()
            .map(SnapshotLine::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn line_texts(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| line.text().to_string())
            .collect()
    }
}

/// A full point-in-time export of a project's pages.
///
/// Field names follow the service's wire format so export files load back
/// into the tool unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub pages: Vec<SnapshotPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<i64>,
}

impl ProjectSnapshot {
    pub fn page_by_id(&self, id: &str) -> Option<&SnapshotPage> {
        self.pages.iter().find(|page| page.id == id)
    }

    /// Replace pages in place by id, appending pages the snapshot has not
    /// seen before (pages created after the backup was taken).
    pub fn upsert_pages(&mut self, fresh: Vec<SnapshotPage>) {
        for page in fresh {
            match self.pages.iter_mut().find(|existing| existing.id == page.id) {
                Some(existing) => *existing = page,
                None => self.pages.push(page),
            }
        }
    }
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
        })
}
