use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use crate::model::{ProjectSnapshot, SnapshotLine, Task};

/// Build a patched snapshot containing only the pages whose tasks carry
/// local edits. Page text is rewritten marker-by-marker; everything else on
/// the page survives untouched.
pub fn build_patched_snapshot(
    original: &ProjectSnapshot,
    tasks: &[Task],
    modified_ids: &BTreeSet<String>,
    task_icon_pattern: &str,
) -> ProjectSnapshot {
    let mut pages = Vec::new();
    for page in &original.pages {
        if !modified_ids.contains(&page.id) {
            continue;
        }
        let Some(task) = tasks.iter().find(|task| task.id == page.id) else {
            continue;
        };

        let mut patched = page.clone();
        patched.updated = task.updated_at;
        let original_lines = page.line_texts();
        patched.lines = original_lines
            .iter()
            .map(|line| {
                SnapshotLine::Text(rewrite_line(line, &original_lines, task, task_icon_pattern))
            })
            .collect();
        pages.push(patched);
    }

    ProjectSnapshot {
        pages,
        project_name: original.project_name.clone(),
        backup_id: original.backup_id.clone(),
        fetched_at: original.fetched_at,
    }
}

/// Apply one exported page set back onto the retained original snapshot so
/// a later export diffs against what was actually shipped. Change history
/// is deliberately left alone: exports are cumulative.
pub fn confirm_export(original: &mut ProjectSnapshot, exported: &ProjectSnapshot) {
    original.upsert_pages(exported.pages.clone());
}

fn rewrite_line(line: &str, page_lines: &[String], task: &Task, icon_pattern: &str) -> String {
    let mut output = line.to_string();

    let status_token = format!("[{}]", task.status.as_deref().unwrap_or("Status_"));
    if contains_marker(&output, "[Status_") {
        output = replace_markers(&output, "[Status_", &status_token);
    } else if !page_lines.iter().any(|line| contains_marker(line, "[Status_"))
        && output.contains(icon_pattern)
    {
        output.push(' ');
        output.push_str(&status_token);
    }

    let stage_token = format!("[{}]", task.stage.as_deref().unwrap_or("Stage_"));
    if contains_marker(&output, "[Stage_") {
        output = replace_markers(&output, "[Stage_", &stage_token);
    } else if !page_lines.iter().any(|line| contains_marker(line, "[Stage_"))
        && output.contains("[Status_")
    {
        output.push(' ');
        output.push_str(&stage_token);
    }

    let assignee_token = format!("[{}]", task.assigned_to.as_deref().unwrap_or("Assigned to "));
    if has_assignee_marker(&output) {
        output = replace_assignee_markers(&output, &assignee_token);
    } else if !page_lines.iter().any(|line| has_assignee_marker(line))
        && output.contains("[stem.icon]")
    {
        output.push(' ');
        output.push_str(&assignee_token);
    }

    output.trim().to_string()
}

fn contains_marker(line: &str, open: &str) -> bool {
    find_marker(line, open, 0).is_some()
}

/// Position and length of the next complete `[Prefix…]` token at or after
/// `from`.
fn find_marker(line: &str, open: &str, from: usize) -> Option<(usize, usize)> {
    let start = line.get(from..)?.find(open)? + from;
    let close = line[start..].find(']')?;
    Some((start, close + 1))
}

fn replace_markers(line: &str, open: &str, replacement: &str) -> String {
    let mut output = String::with_capacity(line.len());
    let mut cursor = 0;
    while let Some((start, len)) = find_marker(line, open, cursor) {
        output.push_str(&line[cursor..start]);
        output.push_str(replacement);
        cursor = start + len;
    }
    output.push_str(&line[cursor..]);
    output
}

fn has_assignee_marker(line: &str) -> bool {
    contains_marker(line, "[Assigned to ") || line.contains("Assigned to [")
}

fn replace_assignee_markers(line: &str, replacement: &str) -> String {
    let mut output = replace_markers(line, "[Assigned to ", replacement);
    // Second notation: `Assigned to [name]` including the bracketed name.
    while let Some(start) = output.find("Assigned to [") {
        let bracket = start + "Assigned to ".len();
        let Some(close) = output[bracket..].find(']') else {
            break;
        };
        output.replace_range(start..bracket + close + 1, replacement);
    }
    output
}

/// Expand the configured filename format (`PROJECT-export-YYYY-MM-DD`)
/// against a project name and a timestamp. More specific placeholders are
/// substituted first so e.g. YYYY never collides with a project name.
pub fn render_export_filename(format: &str, project_name: &str, now: &NaiveDateTime) -> String {
    let stem = format
        .replace("PROJECT", project_name)
        .replace("YYYY", &now.format("%Y").to_string())
        .replace("MM", &now.format("%m").to_string())
        .replace("DD", &now.format("%d").to_string())
        .replace("HH", &now.format("%H").to_string())
        .replace("mm", &now.format("%M").to_string());
    format!("{stem}.json")
}

pub fn write_snapshot(dir: &Path, filename: &str, snapshot: &ProjectSnapshot) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(filename);
    let rendered =
        serde_json::to_string(snapshot).context("failed to serialize export snapshot")?;
    fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
