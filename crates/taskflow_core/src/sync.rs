use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::TaskflowConfig;
use crate::db;
use crate::ingest::{RecognitionRules, ingest_pages, ingest_snapshot};
use crate::merge::{Conflict, MergeEngine};
use crate::model::{ProjectSnapshot, Task, TaskField};
use crate::scrapbox::{ProjectReadApi, fetch_pages, latest_backup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    FullSnapshot,
    IndividualPages,
    UpToDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub mode: RefreshMode,
    pub backup_id: Option<String>,
    pub task_count: usize,
    pub refreshed_pages: usize,
    pub conflict_count: usize,
    pub warnings: Vec<String>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub force_full: bool,
}

#[derive(Debug)]
pub struct RefreshOutcome {
    pub tasks: Vec<Task>,
    pub conflicts: Vec<Conflict>,
    pub report: RefreshReport,
}

/// Two-stage refresh against the wiki service.
///
/// A newer backup than the one last seen triggers a full snapshot merge.
/// Otherwise only the locally modified pages are re-fetched and merged, so
/// a busy edit session does not re-download the whole project.
pub fn refresh_with_api<A: ProjectReadApi + ?Sized>(
    connection: &Connection,
    config: &TaskflowConfig,
    engine: &mut MergeEngine,
    api: &mut A,
    options: &RefreshOptions,
) -> Result<RefreshOutcome> {
    let project = config.project_name();
    let rules = RecognitionRules::from_config(config);

    let last_seen = db::last_backup_id(connection, &project)?;
    let latest = latest_backup(api)?;
    let cached = db::load_snapshot(connection, &project)?;

    let has_new_backup = match (&latest, &last_seen) {
        (Some(latest), Some(last_seen)) => latest.id != *last_seen,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if options.force_full || cached.is_none() || has_new_backup {
        let Some(latest) = latest else {
            bail!("no backups are available for project {project}");
        };
        let snapshot = api
            .backup(&latest.id)
            .with_context(|| format!("failed to fetch backup {}", latest.id))?;
        let outcome = adopt_snapshot(connection, config, engine, snapshot)?;
        let request_count = api.request_count();
        return Ok(RefreshOutcome {
            report: RefreshReport {
                mode: RefreshMode::FullSnapshot,
                backup_id: Some(latest.id),
                task_count: outcome.tasks.len(),
                refreshed_pages: 0,
                conflict_count: outcome.conflicts.len(),
                warnings: outcome.report_warnings,
                request_count,
            },
            tasks: outcome.tasks,
            conflicts: outcome.conflicts,
        });
    }

    // No new backup: re-fetch only the pages with local edits.
    let Some((backup_id, mut snapshot)) = cached else {
        bail!("no cached snapshot for project {project}; run `taskflow fetch --full`");
    };
    let mut current = ingest_snapshot(&snapshot, &rules);
    engine.apply_recorded_changes(&mut current);

    let modified = engine.modified_task_ids();
    let titles: Vec<String> = current
        .iter()
        .filter(|task| modified.contains(&task.id))
        .map(|task| task.title.clone())
        .collect();

    if titles.is_empty() {
        let request_count = api.request_count();
        return Ok(RefreshOutcome {
            report: RefreshReport {
                mode: RefreshMode::UpToDate,
                backup_id: Some(backup_id),
                task_count: current.len(),
                refreshed_pages: 0,
                conflict_count: 0,
                warnings: Vec::new(),
                request_count,
            },
            tasks: current,
            conflicts: Vec::new(),
        });
    }

    let (pages, mut warnings) = fetch_pages(api, &titles)?;
    snapshot.upsert_pages(pages.clone());
    let fresh = ingest_pages(&pages, &rules);
    let refreshed_pages = fresh.len();

    let outcome = engine.merge_with_pages(fresh, current);
    warnings.extend(outcome.warnings);
    db::store_snapshot(connection, &project, &backup_id, &snapshot)?;

    let request_count = api.request_count();
    Ok(RefreshOutcome {
        report: RefreshReport {
            mode: RefreshMode::IndividualPages,
            backup_id: Some(backup_id),
            task_count: outcome.tasks.len(),
            refreshed_pages,
            conflict_count: outcome.conflicts.len(),
            warnings,
            request_count,
        },
        tasks: outcome.tasks,
        conflicts: outcome.conflicts,
    })
}

struct AdoptOutcome {
    tasks: Vec<Task>,
    conflicts: Vec<Conflict>,
    report_warnings: Vec<String>,
}

/// Make a snapshot canonical: ingest, merge against recorded edits, cache
/// it, and remember its backup id. Shared by the full-refresh path and
/// `taskflow load <file>`.
fn adopt_snapshot(
    connection: &Connection,
    config: &TaskflowConfig,
    engine: &mut MergeEngine,
    snapshot: ProjectSnapshot,
) -> Result<AdoptOutcome> {
    let project = config.project_name();
    let rules = RecognitionRules::from_config(config);

    let candidates = ingest_snapshot(&snapshot, &rules);
    let outcome = engine.merge_with_new_data(candidates);

    let backup_id = snapshot
        .backup_id
        .clone()
        .unwrap_or_else(|| "imported".to_string());
    db::store_snapshot(connection, &project, &backup_id, &snapshot)?;
    db::set_last_backup_id(connection, &project, &backup_id)?;

    Ok(AdoptOutcome {
        tasks: outcome.tasks,
        conflicts: outcome.conflicts,
        report_warnings: outcome.warnings,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub backup_id: String,
    pub task_count: usize,
    pub conflict_count: usize,
    pub warnings: Vec<String>,
}

/// Adopt a snapshot read from a local export file instead of the service.
pub fn load_snapshot_data(
    connection: &Connection,
    config: &TaskflowConfig,
    engine: &mut MergeEngine,
    snapshot: ProjectSnapshot,
) -> Result<(Vec<Task>, Vec<Conflict>, LoadReport)> {
    let outcome = adopt_snapshot(connection, config, engine, snapshot)?;
    let report = LoadReport {
        backup_id: db::last_backup_id(connection, &config.project_name())?
            .unwrap_or_else(|| "imported".to_string()),
        task_count: outcome.tasks.len(),
        conflict_count: outcome.conflicts.len(),
        warnings: outcome.report_warnings,
    };
    Ok((outcome.tasks, outcome.conflicts, report))
}

/// The task list as the user currently sees it: the cached snapshot's tasks
/// with recorded local edits overlaid. None when nothing was ever fetched.
pub fn current_view(
    connection: &Connection,
    config: &TaskflowConfig,
    engine: &MergeEngine,
) -> Result<Option<CurrentView>> {
    let project = config.project_name();
    let Some((backup_id, snapshot)) = db::load_snapshot(connection, &project)? else {
        return Ok(None);
    };
    let rules = RecognitionRules::from_config(config);
    let mut tasks = ingest_snapshot(&snapshot, &rules);
    engine.apply_recorded_changes(&mut tasks);
    Ok(Some(CurrentView {
        backup_id,
        snapshot,
        tasks,
    }))
}

#[derive(Debug)]
pub struct CurrentView {
    pub backup_id: String,
    pub snapshot: ProjectSnapshot,
    pub tasks: Vec<Task>,
}

/// Find a task by id, falling back to an exact title match.
pub fn resolve_task<'a>(tasks: &'a [Task], selector: &str) -> Option<&'a Task> {
    tasks
        .iter()
        .find(|task| task.id == selector)
        .or_else(|| tasks.iter().find(|task| task.title == selector))
}

/// Edit-time value normalization: an empty value or a bare marker prefix
/// clears the field.
pub fn normalize_field_value(field: TaskField, value: &str) -> Option<String> {
    let trimmed = value.trim();
    let is_blank = trimmed.is_empty()
        || match field {
            TaskField::Status => trimmed == "Status_",
            TaskField::Stage => trimmed == "Stage_",
            TaskField::AssignedTo => trimmed == "Assigned to",
        };
    if is_blank {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Record one user edit through the engine. Returns the previous value.
pub fn record_edit(
    engine: &mut MergeEngine,
    tasks: &[Task],
    selector: &str,
    field: TaskField,
    value: &str,
) -> Result<EditOutcome> {
    let Some(task) = resolve_task(tasks, selector) else {
        bail!("no task matches {selector}");
    };
    let old_value = task.field(field).map(ToString::to_string);
    let new_value = normalize_field_value(field, value);
    engine.record_change(&task.id, field, old_value.as_deref(), new_value.as_deref());
    Ok(EditOutcome {
        task_id: task.id.clone(),
        task_title: task.title.clone(),
        field,
        old_value,
        new_value,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub task_id: String,
    pub task_title: String,
    pub field: TaskField,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}
