use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::model::{Task, TaskField, now_unix};

/// One recorded local edit to a mergeable field.
///
/// `original` is the value the field held when the edit was made, not
/// necessarily the engine's baseline: repeated edits to the same field
/// between merges overwrite `original` with the previous edit's result.
/// Conflict detection relies on this (see `detect_conflicts`), and the
/// behavior is pinned by tests rather than "fixed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub original: Option<String>,
    pub current: Option<String>,
    pub edited_at: i64,
}

/// All local edits recorded for one task since the last explicit clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub changes: BTreeMap<TaskField, FieldChange>,
    pub created_at: i64,
}

/// Last-observed server-side values for one task's mergeable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BaselineEntry {
    pub status: Option<String>,
    pub stage: Option<String>,
    pub assigned_to: Option<String>,
    pub updated_at: i64,
}

impl BaselineEntry {
    fn from_task(task: &Task) -> Self {
        Self {
            status: task.status.clone(),
            stage: task.stage.clone(),
            assigned_to: task.assigned_to.clone(),
            updated_at: task.updated_at,
        }
    }

    pub fn field(&self, field: TaskField) -> Option<&str> {
        match field {
            TaskField::Status => self.status.as_deref(),
            TaskField::Stage => self.stage.as_deref(),
            TaskField::AssignedTo => self.assigned_to.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub field: TaskField,
    pub original_value: Option<String>,
    pub server_value: Option<String>,
    pub local_value: Option<String>,
}

/// A three-way disagreement on one task, surfaced for the user; the merge
/// has already applied the local values by the time this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub task_id: String,
    pub task_title: String,
    pub fields: Vec<FieldConflict>,
    pub local_changes: BTreeMap<TaskField, FieldChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub tasks: Vec<Task>,
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeStats {
    pub modified_tasks: usize,
    pub total_changes: usize,
}

/// Conflict resolution policy. Only local-wins exists today; the merge has
/// already applied local values unconditionally, so resolving is a no-op
/// acknowledgment. Kept as an enum so a server-wins or per-field policy has
/// somewhere to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    LocalWins,
}

/// Tracks local field edits against a mutable server baseline and
/// reconciles them with fresh snapshot data.
///
/// Owns both stores exclusively. All operations are synchronous and
/// deterministic; data-level problems (orphaned edits, missing baselines)
/// come back as warnings in the outcome, never as errors.
#[derive(Debug, Default)]
pub struct MergeEngine {
    change_history: BTreeMap<String, ChangeRecord>,
    baseline: BTreeMap<String, BaselineEntry>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an engine from persisted stores.
    pub fn from_parts(
        change_history: BTreeMap<String, ChangeRecord>,
        baseline: BTreeMap<String, BaselineEntry>,
    ) -> Self {
        Self {
            change_history,
            baseline,
        }
    }

    pub fn change_history(&self) -> &BTreeMap<String, ChangeRecord> {
        &self.change_history
    }

    pub fn baseline(&self) -> &BTreeMap<String, BaselineEntry> {
        &self.baseline
    }

    /// Drop all recorded edits and baselines and seed the baseline from
    /// `tasks`. Called on first load and on project switch.
    pub fn initialize_from(&mut self, tasks: &[Task]) {
        self.change_history.clear();
        self.baseline.clear();
        for task in tasks {
            self.baseline
                .insert(task.id.clone(), BaselineEntry::from_task(task));
        }
    }

    /// Record one local field edit. The caller passes the value the field
    /// held immediately before the edit; a repeated edit to the same field
    /// therefore replaces `original` with the previous edit's result.
    pub fn record_change(
        &mut self,
        task_id: &str,
        field: TaskField,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) {
        let now = now_unix();
        let record = self
            .change_history
            .entry(task_id.to_string())
            .or_insert_with(|| ChangeRecord {
                changes: BTreeMap::new(),
                created_at: now,
            });
        record.changes.insert(
            field,
            FieldChange {
                original: old_value.map(ToString::to_string),
                current: new_value.map(ToString::to_string),
                edited_at: now,
            },
        );
    }

    /// Reconcile a freshly ingested full task list against recorded edits.
    ///
    /// Local edits always win; conflicts are reported, not blocking. The
    /// returned list has exactly the candidate set's membership; tasks
    /// that only exist locally are not resurrected.
    pub fn merge_with_new_data(&mut self, candidates: Vec<Task>) -> MergeOutcome {
        if self.change_history.is_empty() {
            self.initialize_from(&candidates);
            return MergeOutcome {
                tasks: candidates,
                conflicts: Vec::new(),
                warnings: Vec::new(),
            };
        }

        let mut merged = candidates;
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        for (task_id, record) in &self.change_history {
            let Some(task) = merged.iter_mut().find(|task| task.id == *task_id) else {
                warnings.push(format!(
                    "task {task_id} is missing from the incoming snapshot; keeping its local edits for a later merge"
                ));
                continue;
            };
            let Some(baseline) = self.baseline.get(task_id) else {
                warnings.push(format!(
                    "no recorded baseline for task {task_id}; skipping it this merge"
                ));
                continue;
            };

            let fields = detect_conflicts(task, baseline, record);
            if !fields.is_empty() {
                conflicts.push(Conflict {
                    task_id: task_id.clone(),
                    task_title: task.title.clone(),
                    fields,
                    local_changes: record.changes.clone(),
                });
            }

            apply_changes(task, record);
        }

        for task in &merged {
            self.baseline
                .insert(task.id.clone(), BaselineEntry::from_task(task));
        }

        MergeOutcome {
            tasks: merged,
            conflicts,
            warnings,
        }
    }

    /// Variant entry point for a partial refresh: only the tasks present in
    /// `fresh` are re-merged; everything else in `current` is untouched,
    /// including its baseline entries.
    pub fn merge_with_pages(&mut self, fresh: Vec<Task>, current: Vec<Task>) -> MergeOutcome {
        let mut merged = current;
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();
        let mut refreshed: Vec<Task> = Vec::with_capacity(fresh.len());

        for mut task in fresh {
            if let Some(record) = self.change_history.get(&task.id) {
                match self.baseline.get(&task.id) {
                    Some(baseline) => {
                        let fields = detect_conflicts(&task, baseline, record);
                        if !fields.is_empty() {
                            conflicts.push(Conflict {
                                task_id: task.id.clone(),
                                task_title: task.title.clone(),
                                fields,
                                local_changes: record.changes.clone(),
                            });
                        }
                        apply_changes(&mut task, record);
                    }
                    None => warnings.push(format!(
                        "no recorded baseline for task {}; skipping it this merge",
                        task.id
                    )),
                }
            }
            refreshed.push(task);
        }

        for task in &refreshed {
            self.baseline
                .insert(task.id.clone(), BaselineEntry::from_task(task));
        }
        for task in refreshed {
            match merged.iter_mut().find(|existing| existing.id == task.id) {
                Some(existing) => *existing = task,
                None => merged.push(task),
            }
        }

        MergeOutcome {
            tasks: merged,
            conflicts,
            warnings,
        }
    }

    /// Overlay recorded `current` values onto a task list without touching
    /// either store. This is how display and export read "what the user
    /// sees" from a cached snapshot between merges.
    pub fn apply_recorded_changes(&self, tasks: &mut [Task]) {
        for task in tasks.iter_mut() {
            if let Some(record) = self.change_history.get(&task.id) {
                for (field, change) in &record.changes {
                    task.set_field(*field, change.current.clone());
                }
            }
        }
    }

    /// The canonical "what needs exporting" signal.
    pub fn modified_task_ids(&self) -> BTreeSet<String> {
        self.change_history.keys().cloned().collect()
    }

    pub fn change_stats(&self) -> ChangeStats {
        ChangeStats {
            modified_tasks: self.change_history.len(),
            total_changes: self
                .change_history
                .values()
                .map(|record| record.changes.len())
                .sum(),
        }
    }

    /// Acknowledge surfaced conflicts. Local values were already applied
    /// during the merge, so the only implemented policy has nothing left
    /// to do; it returns how many conflicts it covered.
    pub fn resolve_conflicts(&mut self, conflicts: &[Conflict], resolution: Resolution) -> usize {
        match resolution {
            Resolution::LocalWins => conflicts.len(),
        }
    }

    /// Full session reset: wipes both stores.
    pub fn clear_change_history(&mut self) {
        self.change_history.clear();
        self.baseline.clear();
    }
}

/// Three-way check per edited field: the server disagreeing with the
/// remembered baseline only counts as a conflict when the edit's own
/// `original` still matches that baseline. An edit recorded against a
/// baseline the engine has since replaced is never flagged, a known
/// detection blind spot.
fn detect_conflicts(
    task: &Task,
    baseline: &BaselineEntry,
    record: &ChangeRecord,
) -> Vec<FieldConflict> {
    let mut fields = Vec::new();
    for (field, change) in &record.changes {
        let baseline_value = baseline.field(*field);
        let server_value = task.field(*field);
        if server_value != baseline_value && change.original.as_deref() == baseline_value {
            fields.push(FieldConflict {
                field: *field,
                original_value: baseline_value.map(ToString::to_string),
                server_value: server_value.map(ToString::to_string),
                local_value: change.current.clone(),
            });
        }
    }
    fields
}

/// Unconditional local-wins application: every recorded field overwrites
/// the candidate value and the task is stamped as locally updated.
fn apply_changes(task: &mut Task, record: &ChangeRecord) {
    for (field, change) in &record.changes {
        task.set_field(*field, change.current.clone());
        task.updated_at = now_unix();
    }
}

#[cfg(test)]
mod tests {
    use super::{MergeEngine, Resolution};
    use crate::model::{Task, TaskField};

    fn task(id: &str, status: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            updated_at: 100,
            status: status.map(ToString::to_string),
            stage: None,
            assigned_to: None,
            start_date: None,
            due_date: None,
            project_stem: None,
            parent_task: None,
            tags: Default::default(),
            high_priority: false,
        }
    }

    fn seeded_engine(tasks: &[Task]) -> MergeEngine {
        let mut engine = MergeEngine::new();
        engine.initialize_from(tasks);
        engine
    }

    #[test]
    fn first_merge_without_edits_adopts_candidates_verbatim() {
        let mut engine = MergeEngine::new();
        let outcome =
            engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);

        assert!(outcome.conflicts.is_empty());
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.tasks.len(), 1);
        assert_eq!(outcome.tasks[0].updated_at, 100);
        assert_eq!(
            engine.baseline().get("t1").map(|entry| entry.status.clone()),
            Some(Some("Status_notStarted".to_string()))
        );
    }

    #[test]
    fn repeated_merge_without_edits_is_idempotent() {
        let mut engine = MergeEngine::new();
        let first = engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);
        let second = engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);

        assert_eq!(first.tasks, second.tasks);
        assert!(second.conflicts.is_empty());
    }

    #[test]
    fn local_edit_survives_unchanged_server_value() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);

        assert!(outcome.conflicts.is_empty());
        assert_eq!(
            outcome.tasks[0].status.as_deref(),
            Some("Status_inProgress")
        );
        // Baseline now reflects the merged (post-local-edit) value.
        assert_eq!(
            engine
                .baseline()
                .get("t1")
                .and_then(|entry| entry.status.as_deref()),
            Some("Status_inProgress")
        );
    }

    #[test]
    fn concurrent_server_edit_raises_conflict_and_local_still_wins() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);

        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.task_id, "t1");
        assert_eq!(conflict.fields.len(), 1);
        assert_eq!(conflict.fields[0].field, TaskField::Status);
        assert_eq!(
            conflict.fields[0].original_value.as_deref(),
            Some("Status_notStarted")
        );
        assert_eq!(
            conflict.fields[0].server_value.as_deref(),
            Some("Status_completed")
        );
        assert_eq!(
            conflict.fields[0].local_value.as_deref(),
            Some("Status_inProgress")
        );
        assert_eq!(
            outcome.tasks[0].status.as_deref(),
            Some("Status_inProgress")
        );
    }

    #[test]
    fn merge_stamps_updated_at_on_changed_tasks() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);
        assert!(outcome.tasks[0].updated_at > 100);
    }

    #[test]
    fn orphaned_edit_is_skipped_but_retained() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let outcome = engine.merge_with_new_data(vec![task("t2", Some("Status_review"))]);

        assert_eq!(outcome.tasks.len(), 1);
        assert_eq!(outcome.tasks[0].id, "t2");
        assert_eq!(outcome.conflicts.len(), 0);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("t1"));
        assert!(engine.modified_task_ids().contains("t1"));
    }

    #[test]
    fn missing_baseline_skips_task_with_warning() {
        let mut engine = MergeEngine::new();
        // Edit recorded before any snapshot was ever observed.
        engine.record_change("t1", TaskField::Status, None, Some("Status_inProgress"));

        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("baseline"));
        // The skipped task keeps the server value; the edit stays recorded
        // and reconciles once a baseline exists.
        assert_eq!(
            outcome.tasks[0].status.as_deref(),
            Some("Status_completed")
        );
        assert!(engine.modified_task_ids().contains("t1"));
        // The merge seeded a baseline, so the next one applies the edit.
        let next = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);
        assert_eq!(next.tasks[0].status.as_deref(), Some("Status_inProgress"));
    }

    #[test]
    fn second_edit_overwrites_original_and_weakens_detection() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_inProgress"),
            Some("Status_review"),
        );

        // Server moved away from the remembered baseline, but the second
        // edit's original no longer matches it, so nothing is flagged.
        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.tasks[0].status.as_deref(), Some("Status_review"));
    }

    #[test]
    fn stale_baseline_edit_never_conflicts_after_intermediate_merge() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        // First merge rebuilds the baseline to the merged value.
        engine.merge_with_new_data(vec![task("t1", Some("Status_notStarted"))]);
        // Second merge: server diverged, but the edit's original no longer
        // matches the rebuilt baseline.
        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);

        assert!(outcome.conflicts.is_empty());
        assert_eq!(
            outcome.tasks[0].status.as_deref(),
            Some("Status_inProgress")
        );
    }

    #[test]
    fn merge_with_pages_leaves_other_tasks_untouched() {
        let seed = vec![
            task("t1", Some("Status_notStarted")),
            task("t2", Some("Status_waiting")),
        ];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let outcome = engine.merge_with_pages(
            vec![task("t1", Some("Status_notStarted"))],
            seed.clone(),
        );

        assert_eq!(outcome.tasks.len(), 2);
        assert_eq!(
            outcome.tasks[0].status.as_deref(),
            Some("Status_inProgress")
        );
        assert_eq!(outcome.tasks[1], seed[1]);
        // Only the refreshed task's baseline moved.
        assert_eq!(
            engine
                .baseline()
                .get("t2")
                .and_then(|entry| entry.status.as_deref()),
            Some("Status_waiting")
        );
    }

    #[test]
    fn merge_with_pages_appends_previously_unseen_tasks() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);

        let outcome = engine.merge_with_pages(vec![task("t3", Some("Status_review"))], seed);
        assert_eq!(outcome.tasks.len(), 2);
        assert!(outcome.tasks.iter().any(|task| task.id == "t3"));
    }

    #[test]
    fn apply_recorded_changes_overlays_without_store_mutation() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        let mut view = seed.clone();
        engine.apply_recorded_changes(&mut view);
        assert_eq!(view[0].status.as_deref(), Some("Status_inProgress"));
        assert_eq!(
            engine
                .baseline()
                .get("t1")
                .and_then(|entry| entry.status.as_deref()),
            Some("Status_notStarted")
        );
    }

    #[test]
    fn change_stats_count_tasks_and_fields() {
        let seed = vec![
            task("t1", Some("Status_notStarted")),
            task("t2", Some("Status_waiting")),
        ];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );
        engine.record_change("t1", TaskField::Stage, None, Some("Stage_active"));
        engine.record_change("t2", TaskField::AssignedTo, None, Some("Assigned to ai"));

        let stats = engine.change_stats();
        assert_eq!(stats.modified_tasks, 2);
        assert_eq!(stats.total_changes, 3);
        assert_eq!(engine.modified_task_ids().len(), 2);
    }

    #[test]
    fn resolve_conflicts_acknowledges_local_wins() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );
        let outcome = engine.merge_with_new_data(vec![task("t1", Some("Status_completed"))]);
        assert_eq!(
            engine.resolve_conflicts(&outcome.conflicts, Resolution::LocalWins),
            1
        );
    }

    #[test]
    fn clear_change_history_wipes_both_stores() {
        let seed = vec![task("t1", Some("Status_notStarted"))];
        let mut engine = seeded_engine(&seed);
        engine.record_change(
            "t1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );

        engine.clear_change_history();
        assert!(engine.change_history().is_empty());
        assert!(engine.baseline().is_empty());
        assert!(engine.modified_task_ids().is_empty());
    }
}
