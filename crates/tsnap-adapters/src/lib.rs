//! Upstream task-source contracts, the Asana REST source and a fixture-first source.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use tsnap_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tsnap-adapters";

pub const ASANA_API_BASE: &str = "https://app.asana.com/api/1.0";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{kind} record has no `gid`: {record}")]
    MissingGid { kind: &'static str, record: String },
    #[error("{kind} {gid} not found")]
    NotFound { kind: &'static str, gid: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read-only, possibly paged source of teams, projects and tasks.
#[async_trait]
pub trait TaskSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Resolves a workspace name to its gid; `None` when no workspace matches.
    async fn workspace_gid(&self, name: &str) -> Result<Option<String>, SourceError>;

    async fn list_teams(&self, workspace_gid: &str) -> Result<Vec<JsonValue>, SourceError>;

    async fn list_projects(&self, team_gid: &str) -> Result<Vec<JsonValue>, SourceError>;

    async fn list_tasks(&self, project_gid: &str) -> Result<Vec<JsonValue>, SourceError>;

    async fn task_detail(&self, task_gid: &str) -> Result<JsonValue, SourceError>;
}

/// Everything one extraction pass pulled from the source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    pub teams: Vec<JsonValue>,
    pub projects: Vec<JsonValue>,
    pub tasks: Vec<JsonValue>,
    pub task_details: Vec<JsonValue>,
}

/// Runs teams -> projects -> tasks -> details to completion.
///
/// Each stage fully drains before the next starts, so the returned details
/// are a complete snapshot or the call fails.
pub async fn extract_task_details(
    source: &dyn TaskSource,
    workspace_gid: &str,
) -> Result<Extraction, SourceError> {
    let teams = source.list_teams(workspace_gid).await?;
    info!(teams = teams.len(), "listed teams");
    let projects = projects_for_teams(source, &teams).await?;
    let tasks = tasks_for_projects(source, &projects).await?;
    let task_details = details_for_tasks(source, &tasks).await?;
    Ok(Extraction {
        teams,
        projects,
        tasks,
        task_details,
    })
}

/// Projects of every team, each tagged with its `team_name`.
pub async fn projects_for_teams(
    source: &dyn TaskSource,
    teams: &[JsonValue],
) -> Result<Vec<JsonValue>, SourceError> {
    let mut out = Vec::new();
    for (i, team) in teams.iter().enumerate() {
        info!("getting projects - processed {i} teams out of {}", teams.len());
        let team_gid = gid_of(team, "team")?;
        for mut project in source.list_projects(team_gid).await? {
            annotate(&mut project, "team_name", team.get("name"));
            out.push(project);
        }
    }
    Ok(out)
}

/// Tasks of every project, each tagged with `project_name` and `team_name`.
pub async fn tasks_for_projects(
    source: &dyn TaskSource,
    projects: &[JsonValue],
) -> Result<Vec<JsonValue>, SourceError> {
    let mut out = Vec::new();
    for (i, project) in projects.iter().enumerate() {
        info!("getting tasks - processed {i} projects out of {}", projects.len());
        let project_gid = gid_of(project, "project")?;
        for mut task in source.list_tasks(project_gid).await? {
            annotate(&mut task, "project_name", project.get("name"));
            annotate(&mut task, "team_name", project.get("team_name"));
            out.push(task);
        }
    }
    Ok(out)
}

/// Full detail for every task, carrying over `project_name` and `team_name`.
pub async fn details_for_tasks(
    source: &dyn TaskSource,
    tasks: &[JsonValue],
) -> Result<Vec<JsonValue>, SourceError> {
    let mut out = Vec::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        info!("task details - processed {i} tasks out of {}", tasks.len());
        let task_gid = gid_of(task, "task")?;
        let mut detail = source.task_detail(task_gid).await?;
        annotate(&mut detail, "project_name", task.get("project_name"));
        annotate(&mut detail, "team_name", task.get("team_name"));
        out.push(detail);
    }
    Ok(out)
}

fn gid_of<'a>(record: &'a JsonValue, kind: &'static str) -> Result<&'a str, SourceError> {
    record
        .get("gid")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SourceError::MissingGid {
            kind,
            record: record.to_string(),
        })
}

fn annotate(record: &mut JsonValue, key: &str, value: Option<&JsonValue>) {
    if let Some(map) = record.as_object_mut() {
        map.insert(key.to_string(), value.cloned().unwrap_or(JsonValue::Null));
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Page {
    data: Vec<JsonValue>,
    #[serde(default)]
    next_page: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct Me {
    #[serde(default)]
    workspaces: Vec<NamedResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedResource {
    pub gid: String,
    pub name: String,
}

/// Asana REST API 1.0 source authenticated by the fetcher's bearer token.
#[derive(Debug)]
pub struct AsanaApiSource {
    http: HttpFetcher,
    run_id: Uuid,
    base_url: String,
    page_size: usize,
}

impl AsanaApiSource {
    pub fn new(http: HttpFetcher, run_id: Uuid) -> Self {
        Self {
            http,
            run_id,
            base_url: ASANA_API_BASE.to_string(),
            page_size: 100,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }

    pub fn collection_url(&self, path: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!("{}{}?limit={}", self.base_url, path, self.page_size);
        for (key, value) in query {
            url.push_str(&format!("&{key}={value}"));
        }
        url
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        let envelope: Envelope<T> = self.http.fetch_json(self.run_id, self.source_id(), url).await?;
        Ok(envelope.data)
    }

    async fn get_all(&self, first_url: String) -> Result<Vec<JsonValue>, SourceError> {
        let mut out = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next.take() {
            let page: Page = self.http.fetch_json(self.run_id, self.source_id(), &url).await?;
            out.extend(page.data);
            next = page.next_page.map(|p| p.uri);
        }
        Ok(out)
    }
}

#[async_trait]
impl TaskSource for AsanaApiSource {
    fn source_id(&self) -> &'static str {
        "asana"
    }

    async fn workspace_gid(&self, name: &str) -> Result<Option<String>, SourceError> {
        let me: Me = self.get(&format!("{}/users/me", self.base_url)).await?;
        Ok(find_workspace(&me.workspaces, name))
    }

    async fn list_teams(&self, workspace_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        let path = format!("/organizations/{workspace_gid}/teams");
        self.get_all(self.collection_url(&path, &[])).await
    }

    async fn list_projects(&self, team_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        let path = format!("/teams/{team_gid}/projects");
        self.get_all(self.collection_url(&path, &[("archived", "false")]))
            .await
    }

    async fn list_tasks(&self, project_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        let path = format!("/projects/{project_gid}/tasks");
        self.get_all(self.collection_url(&path, &[])).await
    }

    async fn task_detail(&self, task_gid: &str) -> Result<JsonValue, SourceError> {
        self.get(&format!("{}/tasks/{task_gid}", self.base_url)).await
    }
}

fn find_workspace(workspaces: &[NamedResource], name: &str) -> Option<String> {
    workspaces
        .iter()
        .find(|w| w.name == name)
        .map(|w| w.gid.clone())
}

/// On-disk capture of a workspace, keyed by parent gid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceFixture {
    pub workspaces: Vec<NamedResource>,
    #[serde(default)]
    pub teams: BTreeMap<String, Vec<JsonValue>>,
    #[serde(default)]
    pub projects: BTreeMap<String, Vec<JsonValue>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<JsonValue>>,
    #[serde(default)]
    pub task_details: BTreeMap<String, JsonValue>,
}

pub fn load_workspace_fixture(path: impl AsRef<Path>) -> Result<WorkspaceFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureTaskSource {
    fixture: WorkspaceFixture,
}

impl FixtureTaskSource {
    pub fn new(fixture: WorkspaceFixture) -> Self {
        Self { fixture }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_workspace_fixture(path)?))
    }
}

#[async_trait]
impl TaskSource for FixtureTaskSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn workspace_gid(&self, name: &str) -> Result<Option<String>, SourceError> {
        Ok(find_workspace(&self.fixture.workspaces, name))
    }

    async fn list_teams(&self, workspace_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        Ok(self.fixture.teams.get(workspace_gid).cloned().unwrap_or_default())
    }

    async fn list_projects(&self, team_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        Ok(self.fixture.projects.get(team_gid).cloned().unwrap_or_default())
    }

    async fn list_tasks(&self, project_gid: &str) -> Result<Vec<JsonValue>, SourceError> {
        Ok(self.fixture.tasks.get(project_gid).cloned().unwrap_or_default())
    }

    async fn task_detail(&self, task_gid: &str) -> Result<JsonValue, SourceError> {
        self.fixture
            .task_details
            .get(task_gid)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                kind: "task",
                gid: task_gid.to_string(),
            })
    }
}
