use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TaskflowConfig;
use crate::model::{ProjectSnapshot, SnapshotPage, now_unix};

#[derive(Debug, Clone, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    #[serde(default)]
    pub backuped: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// Read seam to the backing wiki service. Pipelines and the CLI depend on
/// this trait, not on the HTTP client, so tests run against a mock.
pub trait ProjectReadApi {
    fn backup_list(&mut self) -> Result<Vec<BackupInfo>>;
    fn backup(&mut self, backup_id: &str) -> Result<ProjectSnapshot>;
    fn page(&mut self, title: &str) -> Result<Option<SnapshotPage>>;
    fn project_info(&mut self) -> Result<ProjectInfo>;
    fn request_count(&self) -> usize;
}

/// Newest backup by creation time, if the service has any.
pub fn latest_backup<A: ProjectReadApi + ?Sized>(api: &mut A) -> Result<Option<BackupInfo>> {
    let mut backups = api.backup_list()?;
    backups.sort_by(|left, right| right.backuped.cmp(&left.backuped));
    Ok(backups.into_iter().next())
}

/// Fetch a set of pages one by one. Pages the service no longer has are
/// skipped with a warning instead of failing the whole refresh.
pub fn fetch_pages<A: ProjectReadApi + ?Sized>(
    api: &mut A,
    titles: &[String],
) -> Result<(Vec<SnapshotPage>, Vec<String>)> {
    let mut pages = Vec::new();
    let mut warnings = Vec::new();
    for title in titles {
        match api.page(title)? {
            Some(page) => pages.push(page),
            None => warnings.push(format!("page not found on the service: {title}")),
        }
    }
    Ok((pages, warnings))
}

#[derive(Debug, Clone)]
pub struct ScrapboxClientConfig {
    pub base_url: String,
    pub project: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub request_delay_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ScrapboxClientConfig {
    pub fn from_config(config: &TaskflowConfig) -> Self {
        Self {
            base_url: config.api_base_url(),
            project: config.project_name(),
            token: config.auth_token(),
            timeout_ms: config.api.timeout_ms.unwrap_or(30_000),
            request_delay_ms: config.api.request_delay_ms.unwrap_or(200),
            max_retries: config.api.max_retries.unwrap_or(2),
            retry_delay_ms: 500,
        }
    }
}

pub struct ScrapboxClient {
    client: Client,
    config: ScrapboxClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ScrapboxClient {
    pub fn new(config: ScrapboxClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build wiki service HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn from_config(config: &TaskflowConfig) -> Result<Self> {
        Self::new(ScrapboxClientConfig::from_config(config))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .with_context(|| format!("invalid API base URL: {}", self.config.base_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("API base URL cannot carry path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document with rate limiting and bounded retries on
    /// transient failures. A 404 surfaces as Ok(None).
    fn request_json(&mut self, url: &Url) -> Result<Option<Value>> {
        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let mut request = self
                .client
                .get(url.clone())
                .header("Accept", "application/json");
            if let Some(token) = &self.config.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("wiki service request failed with HTTP {status} for {url}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode wiki service JSON response")?;
                    return Ok(Some(payload));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call {url}"));
                }
            }
        }
        bail!("wiki service request exhausted retry budget for {url}")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.request_delay_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        sleep(Duration::from_millis(base));
    }
}

impl ProjectReadApi for ScrapboxClient {
    fn backup_list(&mut self) -> Result<Vec<BackupInfo>> {
        let url = self.endpoint(&["project-backup", &self.config.project, "list"])?;
        let payload = self
            .request_json(&url)?
            .ok_or_else(|| anyhow::anyhow!("backup list not found for {}", self.config.project))?;
        let parsed: BackupListResponse =
            serde_json::from_value(payload).context("failed to decode backup list response")?;
        Ok(parsed.backups)
    }

    fn backup(&mut self, backup_id: &str) -> Result<ProjectSnapshot> {
        let file = format!("{backup_id}.json");
        let url = self.endpoint(&["project-backup", &self.config.project, &file])?;
        let payload = self
            .request_json(&url)?
            .ok_or_else(|| anyhow::anyhow!("backup {backup_id} not found"))?;
        let parsed: BackupPayload =
            serde_json::from_value(payload).context("failed to decode backup payload")?;
        Ok(ProjectSnapshot {
            pages: parsed.pages,
            project_name: Some(self.config.project.clone()),
            backup_id: Some(backup_id.to_string()),
            fetched_at: Some(now_unix()),
        })
    }

    fn page(&mut self, title: &str) -> Result<Option<SnapshotPage>> {
        let url = self.endpoint(&["pages", &self.config.project, title])?;
        let Some(payload) = self.request_json(&url)? else {
            return Ok(None);
        };
        let page: SnapshotPage = serde_json::from_value(payload)
            .with_context(|| format!("failed to decode page response for {title}"))?;
        Ok(Some(page))
    }

    fn project_info(&mut self) -> Result<ProjectInfo> {
        let url = self.endpoint(&["projects", &self.config.project])?;
        let payload = self
            .request_json(&url)?
            .ok_or_else(|| anyhow::anyhow!("project not found: {}", self.config.project))?;
        serde_json::from_value(payload).context("failed to decode project info response")
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct BackupListResponse {
    #[serde(default)]
    backups: Vec<BackupInfo>,
}

#[derive(Debug, Deserialize)]
struct BackupPayload {
    #[serde(default)]
    pages: Vec<SnapshotPage>,
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{BackupInfo, ProjectInfo, ProjectReadApi, fetch_pages, latest_backup};
    use crate::model::{ProjectSnapshot, SnapshotPage};

    #[derive(Default)]
    struct StaticApi {
        backups: Vec<BackupInfo>,
        pages: Vec<SnapshotPage>,
        request_count: usize,
    }

    impl ProjectReadApi for StaticApi {
        fn backup_list(&mut self) -> Result<Vec<BackupInfo>> {
            self.request_count += 1;
            Ok(self.backups.clone())
        }

        fn backup(&mut self, backup_id: &str) -> Result<ProjectSnapshot> {
            self.request_count += 1;
            Ok(ProjectSnapshot {
                pages: self.pages.clone(),
                project_name: None,
                backup_id: Some(backup_id.to_string()),
                fetched_at: None,
            })
        }

        fn page(&mut self, title: &str) -> Result<Option<SnapshotPage>> {
            self.request_count += 1;
            Ok(self.pages.iter().find(|page| page.title == title).cloned())
        }

        fn project_info(&mut self) -> Result<ProjectInfo> {
            self.request_count += 1;
            Ok(ProjectInfo {
                name: "atlas-wiki".to_string(),
                display_name: None,
                count: Some(self.pages.len() as u64),
            })
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn backup(id: &str, backuped: i64) -> BackupInfo {
        BackupInfo {
            id: id.to_string(),
            backuped,
        }
    }

    #[test]
    fn latest_backup_picks_newest_by_creation_time() {
        let mut api = StaticApi {
            backups: vec![backup("old", 100), backup("new", 300), backup("mid", 200)],
            ..StaticApi::default()
        };
        let latest = latest_backup(&mut api).expect("latest").expect("some");
        assert_eq!(latest.id, "new");
    }

    #[test]
    fn latest_backup_handles_empty_list() {
        let mut api = StaticApi::default();
        assert!(latest_backup(&mut api).expect("latest").is_none());
    }

    #[test]
    fn fetch_pages_skips_missing_titles_with_warning() {
        let mut api = StaticApi {
            pages: vec![SnapshotPage {
                id: "p1".to_string(),
                title: "Alpha".to_string(),
                updated: 1,
                lines: vec![],
            }],
            ..StaticApi::default()
        };
        let (pages, warnings) = fetch_pages(
            &mut api,
            &["Alpha".to_string(), "Missing".to_string()],
        )
        .expect("fetch");
        assert_eq!(pages.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Missing"));
    }
}
