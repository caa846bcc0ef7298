use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_PROJECT_NAME: &str = "your-project";
pub const DEFAULT_TASK_ICON: &str = "leaves";
pub const DEFAULT_API_BASE_URL: &str = "https://scrapbox.io/api";
pub const DEFAULT_STATUS_TAGS: &str =
    "Status_notStarted,Status_inProgress,Status_waiting,Status_review,Status_completed";
pub const DEFAULT_STAGE_TAGS: &str = "Stage_inactive,Stage_active,Stage_someday,Stage_temp";
pub const DEFAULT_ASSIGNEE_TAGS: &str = "Assigned to human,Assigned to ai";
pub const DEFAULT_EXCLUDE_TAGS: &str = "Exclude";
pub const DEFAULT_FILENAME_FORMAT: &str = "PROJECT-export-YYYY-MM-DD";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TaskflowConfig {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub recognition: RecognitionSection,
    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProjectSection {
    pub name: Option<String>,
    pub task_icon: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub request_delay_ms: Option<u64>,
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RecognitionSection {
    pub status_tags: Option<String>,
    pub stage_tags: Option<String>,
    pub assignee_tags: Option<String>,
    pub exclude_tags: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportSection {
    pub filename_format: Option<String>,
    pub fetch_before_export: Option<bool>,
}

impl TaskflowConfig {
    /// Resolve the project name: env TASKFLOW_PROJECT > config > default.
    pub fn project_name(&self) -> String {
        if let Some(value) = non_empty_env("TASKFLOW_PROJECT") {
            return value;
        }
        self.project
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
    }

    pub fn task_icon(&self) -> String {
        self.project
            .task_icon
            .clone()
            .unwrap_or_else(|| DEFAULT_TASK_ICON.to_string())
    }

    /// The token that marks a page as a task, e.g. `[leaves.icon]`.
    pub fn task_icon_pattern(&self) -> String {
        format!("[{}.icon]", self.task_icon())
    }

    /// Resolve the API base URL: env TASKFLOW_API_URL > config > default.
    pub fn api_base_url(&self) -> String {
        if let Some(value) = non_empty_env("TASKFLOW_API_URL") {
            return value.trim_end_matches('/').to_string();
        }
        self.api
            .base_url
            .clone()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    /// The auth token only ever comes from the environment (or .env); it is
    /// never written into the config file.
    pub fn auth_token(&self) -> Option<String> {
        non_empty_env("TASKFLOW_TOKEN")
    }

    pub fn filename_format(&self) -> String {
        self.export
            .filename_format
            .clone()
            .unwrap_or_else(|| DEFAULT_FILENAME_FORMAT.to_string())
    }

    pub fn fetch_before_export(&self) -> bool {
        self.export.fetch_before_export.unwrap_or(true)
    }
}

impl RecognitionSection {
    pub fn status_tag_set(&self) -> BTreeSet<String> {
        split_tags(self.status_tags.as_deref().unwrap_or(DEFAULT_STATUS_TAGS))
            .into_iter()
            .collect()
    }

    pub fn stage_tag_set(&self) -> BTreeSet<String> {
        split_tags(self.stage_tags.as_deref().unwrap_or(DEFAULT_STAGE_TAGS))
            .into_iter()
            .collect()
    }

    pub fn assignee_tag_set(&self) -> BTreeSet<String> {
        split_tags(
            self.assignee_tags
                .as_deref()
                .unwrap_or(DEFAULT_ASSIGNEE_TAGS),
        )
        .into_iter()
        .collect()
    }

    pub fn exclude_tag_list(&self) -> Vec<String> {
        split_tags(self.exclude_tags.as_deref().unwrap_or(DEFAULT_EXCLUDE_TAGS))
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load and parse a TaskflowConfig from a TOML file. Returns default if the
/// file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<TaskflowConfig> {
    if !config_path.exists() {
        return Ok(TaskflowConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: TaskflowConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub set_project_name: Option<String>,
    pub set_task_icon: Option<String>,
    pub set_api_base_url: Option<String>,
    pub set_status_tags: Option<String>,
    pub set_stage_tags: Option<String>,
    pub set_assignee_tags: Option<String>,
    pub set_exclude_tags: Option<String>,
    pub set_filename_format: Option<String>,
    pub set_fetch_before_export: Option<bool>,
}

impl ConfigPatch {
    /// Build a patch from a dotted settings key as accepted by the CLI.
    pub fn from_key_value(key: &str, value: &str) -> Result<Self> {
        let mut patch = Self::default();
        match key {
            "project.name" => patch.set_project_name = Some(value.to_string()),
            "project.task_icon" => patch.set_task_icon = Some(value.to_string()),
            "api.base_url" => patch.set_api_base_url = Some(value.to_string()),
            "recognition.status_tags" => patch.set_status_tags = Some(value.to_string()),
            "recognition.stage_tags" => patch.set_stage_tags = Some(value.to_string()),
            "recognition.assignee_tags" => patch.set_assignee_tags = Some(value.to_string()),
            "recognition.exclude_tags" => patch.set_exclude_tags = Some(value.to_string()),
            "export.filename_format" => patch.set_filename_format = Some(value.to_string()),
            "export.fetch_before_export" => {
                patch.set_fetch_before_export = Some(value.parse().with_context(|| {
                    format!("export.fetch_before_export expects true/false, got {value}")
                })?);
            }
            other => bail!("unknown config key: {other}"),
        }
        Ok(patch)
    }

    fn is_empty(&self) -> bool {
        self.set_project_name.is_none()
            && self.set_task_icon.is_none()
            && self.set_api_base_url.is_none()
            && self.set_status_tags.is_none()
            && self.set_stage_tags.is_none()
            && self.set_assignee_tags.is_none()
            && self.set_exclude_tags.is_none()
            && self.set_filename_format.is_none()
            && self.set_fetch_before_export.is_none()
    }
}

/// Update selected keys while preserving all other config sections and any
/// comments-free structure already in the file. Returns `true` when a write
/// occurred.
pub fn patch_config(config_path: &Path, patch: &ConfigPatch) -> Result<bool> {
    if patch.is_empty() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("top-level TOML must be a table in {}", config_path.display())
    })?;

    let string_patches: [(&str, &str, &Option<String>); 8] = [
        ("project", "name", &patch.set_project_name),
        ("project", "task_icon", &patch.set_task_icon),
        ("api", "base_url", &patch.set_api_base_url),
        ("recognition", "status_tags", &patch.set_status_tags),
        ("recognition", "stage_tags", &patch.set_stage_tags),
        ("recognition", "assignee_tags", &patch.set_assignee_tags),
        ("recognition", "exclude_tags", &patch.set_exclude_tags),
        ("export", "filename_format", &patch.set_filename_format),
    ];
    for (section, key, value) in string_patches {
        if let Some(value) = value {
            section_table(root_table, section, config_path)?
                .insert(key.to_string(), Value::String(value.clone()));
        }
    }
    if let Some(value) = patch.set_fetch_before_export {
        section_table(root_table, "export", config_path)?
            .insert("fetch_before_export".to_string(), Value::Boolean(value));
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn section_table<'a>(
    root: &'a mut toml::map::Map<String, Value>,
    section: &str,
    config_path: &Path,
) -> Result<&'a mut toml::map::Map<String, Value>> {
    let entry = root
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    entry.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("[{section}] must be a table in {}", config_path.display())
    })
}
