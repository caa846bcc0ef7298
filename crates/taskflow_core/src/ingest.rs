use std::collections::BTreeSet;

use crate::config::TaskflowConfig;
use crate::model::{ProjectSnapshot, SnapshotPage, Task};

/// How task pages are recognized inside a snapshot: the icon token that
/// marks a page as a task, and the tags that veto recognition.
#[derive(Debug, Clone)]
pub struct RecognitionRules {
    pub task_icon_pattern: String,
    pub exclude_tags: Vec<String>,
}

impl RecognitionRules {
    pub fn from_config(config: &TaskflowConfig) -> Self {
        Self {
            task_icon_pattern: config.task_icon_pattern(),
            exclude_tags: config.recognition.exclude_tag_list(),
        }
    }
}

/// Scan a snapshot for task pages and normalize them into Task Records.
/// The returned list is deduplicated by page id (first occurrence wins),
/// ready for the merge engine.
pub fn ingest_snapshot(snapshot: &ProjectSnapshot, rules: &RecognitionRules) -> Vec<Task> {
    ingest_pages(&snapshot.pages, rules)
}

pub fn ingest_pages(pages: &[SnapshotPage], rules: &RecognitionRules) -> Vec<Task> {
    let mut seen = BTreeSet::new();
    let mut tasks = Vec::new();
    for page in pages {
        let content = page.content();
        if !content.contains(&rules.task_icon_pattern) {
            continue;
        }
        if is_excluded(&content, &rules.exclude_tags) {
            continue;
        }
        if !seen.insert(page.id.clone()) {
            continue;
        }
        tasks.push(parse_task(page, &content));
    }
    tasks
}

fn is_excluded(content: &str, exclude_tags: &[String]) -> bool {
    exclude_tags.iter().any(|tag| {
        content.contains(&format!("#{tag}")) || content.contains(&format!("[{tag}]"))
    })
}

fn parse_task(page: &SnapshotPage, content: &str) -> Task {
    // Both assignee notations occur in the wild; the bracketed-marker form
    // takes precedence and keeps its "Assigned to " prefix.
    let assigned_to = capture(content, "[Assigned to ", ']')
        .map(|name| format!("Assigned to {name}"))
        .or_else(|| capture(content, "Assigned to [", ']').map(ToString::to_string));

    Task {
        id: page.id.clone(),
        title: page.title.clone(),
        updated_at: page.updated,
        status: marker_token(content, "[Status_"),
        stage: marker_token(content, "[Stage_"),
        assigned_to,
        start_date: capture(content, "Start Date [", ']').map(ToString::to_string),
        due_date: capture(content, "Due Date [", ']').map(ToString::to_string),
        project_stem: capture(content, "[stem.icon][", ']').map(ToString::to_string),
        parent_task: capture(content, "from [", ']').map(ToString::to_string),
        tags: hashtags(content),
        high_priority: has_high_priority(content),
    }
}

/// First `[Prefix…]` token in the content, returned with its prefix but
/// without the surrounding brackets (`[Status_done]` → `Status_done`).
fn marker_token(content: &str, open: &str) -> Option<String> {
    let start = content.find(open)?;
    let inner = &content[start + 1..];
    let end = inner.find(']')?;
    let value = inner[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Text between the first occurrence of `open` and the following `close`,
/// trimmed; empty captures count as absent.
fn capture<'a>(content: &'a str, open: &str, close: char) -> Option<&'a str> {
    let start = content.find(open)? + open.len();
    let rest = &content[start..];
    let end = rest.find(close)?;
    let value = rest[..end].trim();
    if value.is_empty() { None } else { Some(value) }
}

fn hashtags(content: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let mut rest = content;
    while let Some(index) = rest.find('#') {
        rest = &rest[index + 1..];
        let end = rest
            .find(|ch: char| ch.is_whitespace() || matches!(ch, ',' | '[' | ']'))
            .unwrap_or(rest.len());
        let tag = &rest[..end];
        if !tag.is_empty() {
            tags.insert(tag.to_string());
        }
        rest = &rest[end..];
    }
    tags
}

fn has_high_priority(content: &str) -> bool {
    ["#Importance_high", "[Importance_high]", "#Urgency_high", "[Urgency_high]"]
        .iter()
        .any(|marker| content.contains(marker))
}
