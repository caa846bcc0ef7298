use std::cmp::Ordering;

use chrono::NaiveDate;

use crate::model::Task;

/// Board-level task selection. `None` selectors mean "all"; the visibility
/// toggles default to hiding completed, inactive, and not-yet-started
/// tasks the way the board does.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub stage: Option<String>,
    pub assignee: Option<String>,
    pub stem: StemSelector,
    pub show_completed: bool,
    pub show_inactive: bool,
    pub show_before_start: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StemSelector {
    #[default]
    Any,
    Unassigned,
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Smart,
    UpdatedDesc,
    UpdatedAsc,
    DueDateAsc,
    DueDateDesc,
    TitleAsc,
}

impl SortKey {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "smart" => Some(Self::Smart),
            "updated-desc" => Some(Self::UpdatedDesc),
            "updated-asc" => Some(Self::UpdatedAsc),
            "due-date-asc" => Some(Self::DueDateAsc),
            "due-date-desc" => Some(Self::DueDateDesc),
            "title-asc" => Some(Self::TitleAsc),
            _ => None,
        }
    }
}

pub fn filter_tasks(tasks: &[Task], filter: &TaskFilter, today: NaiveDate) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| matches_filter(task, filter, today))
        .cloned()
        .collect()
}

fn matches_filter(task: &Task, filter: &TaskFilter, today: NaiveDate) -> bool {
    // An explicit selection of the hidden value overrides its hide toggle.
    if !filter.show_completed
        && filter.status.as_deref() != Some("Status_completed")
        && task.status.as_deref() == Some("Status_completed")
    {
        return false;
    }
    if !filter.show_inactive
        && filter.stage.as_deref() != Some("Stage_inactive")
        && task.stage.as_deref() == Some("Stage_inactive")
    {
        return false;
    }
    if !filter.show_before_start
        && let Some(start) = task.start_date.as_deref().and_then(parse_date)
        && start > today
    {
        return false;
    }

    if let Some(status) = &filter.status
        && task.status.as_deref() != Some(status.as_str())
    {
        return false;
    }
    if let Some(stage) = &filter.stage
        && task.stage.as_deref() != Some(stage.as_str())
    {
        return false;
    }
    if let Some(assignee) = &filter.assignee
        && task.assigned_to.as_deref() != Some(assignee.as_str())
    {
        return false;
    }
    match &filter.stem {
        StemSelector::Any => true,
        StemSelector::Unassigned => task.project_stem.is_none(),
        StemSelector::Named(name) => task.project_stem.as_deref() == Some(name.as_str()),
    }
}

pub fn sort_tasks(tasks: &mut [Task], key: SortKey) {
    match key {
        SortKey::Smart => tasks.sort_by(smart_order),
        SortKey::UpdatedDesc => tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
        SortKey::UpdatedAsc => tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
        SortKey::DueDateAsc => tasks.sort_by(|a, b| due_date_order(a, b)),
        SortKey::DueDateDesc => tasks.sort_by(|a, b| due_date_order_desc(a, b)),
        SortKey::TitleAsc => tasks.sort_by(|a, b| a.title.cmp(&b.title)),
    }
}

/// Board default ordering: due date (absent last), then high
/// importance/urgency, then status urgency, then recency.
fn smart_order(a: &Task, b: &Task) -> Ordering {
    let by_due = due_date_order(a, b);
    if by_due != Ordering::Equal {
        return by_due;
    }
    let by_priority = b.high_priority.cmp(&a.high_priority);
    if by_priority != Ordering::Equal {
        return by_priority;
    }
    let by_status = status_priority(a.status.as_deref()).cmp(&status_priority(b.status.as_deref()));
    if by_status != Ordering::Equal {
        return by_status;
    }
    b.updated_at.cmp(&a.updated_at)
}

fn due_date_order(a: &Task, b: &Task) -> Ordering {
    let a_due = a.due_date.as_deref().and_then(parse_date);
    let b_due = b.due_date.as_deref().and_then(parse_date);
    match (a_due, b_due) {
        (Some(a_due), Some(b_due)) => a_due.cmp(&b_due),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// Undated tasks stay last even when the dated ordering is reversed.
fn due_date_order_desc(a: &Task, b: &Task) -> Ordering {
    let a_due = a.due_date.as_deref().and_then(parse_date);
    let b_due = b.due_date.as_deref().and_then(parse_date);
    match (a_due, b_due) {
        (Some(a_due), Some(b_due)) => b_due.cmp(&a_due),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn status_priority(status: Option<&str>) -> u32 {
    match status {
        Some("Status_inProgress") => 1,
        Some("Status_waiting") => 2,
        Some("Status_review") => 3,
        Some("Status_notStarted") => 4,
        Some("Status_completed") => 5,
        _ => 999,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{SortKey, StemSelector, TaskFilter, filter_tasks, sort_tasks};
    use crate::model::Task;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            updated_at: 100,
            status: Some("Status_notStarted".to_string()),
            stage: Some("Stage_active".to_string()),
            assigned_to: None,
            start_date: None,
            due_date: None,
            project_stem: None,
            parent_task: None,
            tags: Default::default(),
            high_priority: false,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 5).expect("date")
    }

    #[test]
    fn completed_tasks_are_hidden_by_default() {
        let mut done = task("done");
        done.status = Some("Status_completed".to_string());
        let tasks = vec![task("open"), done];

        let visible = filter_tasks(&tasks, &TaskFilter::default(), today());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "open");

        let filter = TaskFilter {
            status: Some("Status_completed".to_string()),
            ..TaskFilter::default()
        };
        let completed_only = filter_tasks(&tasks, &filter, today());
        assert_eq!(completed_only.len(), 1);
        assert_eq!(completed_only[0].id, "done");
    }

    #[test]
    fn future_start_dates_are_hidden_unless_enabled() {
        let mut future = task("future");
        future.start_date = Some("2026-09-01".to_string());
        let mut started = task("started");
        started.start_date = Some("2026-08-01".to_string());
        let tasks = vec![future, started];

        let visible = filter_tasks(&tasks, &TaskFilter::default(), today());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "started");

        let all = filter_tasks(
            &tasks,
            &TaskFilter {
                show_before_start: true,
                ..TaskFilter::default()
            },
            today(),
        );
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn stem_selector_distinguishes_unassigned() {
        let mut atlas = task("atlas");
        atlas.project_stem = Some("Atlas".to_string());
        let loose = task("loose");
        let tasks = vec![atlas, loose];

        let unassigned = filter_tasks(
            &tasks,
            &TaskFilter {
                stem: StemSelector::Unassigned,
                ..TaskFilter::default()
            },
            today(),
        );
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].id, "loose");

        let named = filter_tasks(
            &tasks,
            &TaskFilter {
                stem: StemSelector::Named("Atlas".to_string()),
                ..TaskFilter::default()
            },
            today(),
        );
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].id, "atlas");
    }

    #[test]
    fn smart_sort_orders_by_due_then_priority_then_status() {
        let mut due_soon = task("due-soon");
        due_soon.due_date = Some("2026-08-10".to_string());
        let mut due_later = task("due-later");
        due_later.due_date = Some("2026-08-20".to_string());
        let mut urgent = task("urgent");
        urgent.high_priority = true;
        let mut in_progress = task("in-progress");
        in_progress.status = Some("Status_inProgress".to_string());
        let plain = task("plain");

        let mut tasks = vec![plain, in_progress, urgent, due_later, due_soon];
        sort_tasks(&mut tasks, SortKey::Smart);

        let order: Vec<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(
            order,
            vec!["due-soon", "due-later", "urgent", "in-progress", "plain"]
        );
    }

    #[test]
    fn due_date_sort_places_undated_last_both_ways() {
        let mut dated = task("dated");
        dated.due_date = Some("2026-08-10".to_string());
        let undated = task("undated");

        let mut tasks = vec![undated.clone(), dated.clone()];
        sort_tasks(&mut tasks, SortKey::DueDateAsc);
        assert_eq!(tasks[0].id, "dated");

        let mut tasks = vec![undated, dated];
        sort_tasks(&mut tasks, SortKey::DueDateDesc);
        assert_eq!(tasks[1].id, "undated");
    }

    #[test]
    fn invalid_due_dates_sort_like_absent_ones() {
        let mut broken = task("broken");
        broken.due_date = Some("soon".to_string());
        let mut dated = task("dated");
        dated.due_date = Some("2026-08-10".to_string());

        let mut tasks = vec![broken, dated];
        sort_tasks(&mut tasks, SortKey::DueDateAsc);
        assert_eq!(tasks[0].id, "dated");
    }
}
