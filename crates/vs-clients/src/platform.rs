//! Typed client for the agent platform: agents, memory blocks, tools,
//! folders, sources, and file uploads.
//!
//! Two wire-level invariants live here. Query parameters (`tags`,
//! `match_all_tags`, `limit`, `offset`, `include`, `order`) are preserved
//! end-to-end and verified by a startup self-check, and empty-body `PATCH`
//! requests carry no body at all -- never an empty string the platform would
//! reject as invalid JSON.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{HttpError, HttpPool};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("platform returned HTTP {0}")]
    Http(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("request timed out")]
    Timeout,
    /// 409 on creation: the entity already exists; fetch-then-continue.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The platform dropped query parameters or otherwise broke its REST
    /// contract.
    #[error("contract violation: {0}")]
    Contract(String),
}

impl From<HttpError> for AgentApiError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Network(msg) => AgentApiError::Network(msg),
            HttpError::Status(409) => AgentApiError::Conflict("409".to_string()),
            HttpError::Status(code) => AgentApiError::Http(code),
            HttpError::Timeout => AgentApiError::Timeout,
            HttpError::Cancelled => AgentApiError::Network("cancelled".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentApiError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformAgent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: String,
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    /// Hash of the most recent upload, when the platform reports one.
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl Source {
    /// A placeholder instructs callers to skip uploads for this source
    /// rather than crash; produced when a 409'd source cannot be located.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            content_hash: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.is_empty()
    }
}

/// New memory block attached at agent creation.
#[derive(Debug, Clone, Serialize)]
pub struct NewBlock {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAgent {
    pub name: String,
    pub tags: Vec<String>,
    pub model: String,
    pub embedding: String,
    pub memory_blocks: Vec<NewBlock>,
}

/// Server-side agent listing filter. Every populated field must reach the
/// wire; see [`PlatformClient::verify_query_params`].
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub match_all_tags: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub include: Option<String>,
    pub order: Option<String>,
}

impl AgentQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_tags(tags: Vec<String>, match_all: bool) -> Self {
        Self {
            tags,
            match_all_tags: match_all,
            ..Default::default()
        }
    }

    /// Flatten into repeated query pairs, preserving every parameter.
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(name) = &self.name {
            pairs.push(("name".to_string(), name.clone()));
        }
        for tag in &self.tags {
            pairs.push(("tags".to_string(), tag.clone()));
        }
        if !self.tags.is_empty() {
            pairs.push(("match_all_tags".to_string(), self.match_all_tags.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        if let Some(include) = &self.include {
            pairs.push(("include".to_string(), include.clone()));
        }
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        pairs
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PlatformClient {
    pool: Arc<HttpPool>,
    base_url: String,
    api_key: Option<String>,
    /// Content hashes keyed by `(agent_id, block_label)`; cleared after each
    /// sync run.
    block_hashes: DashMap<(String, String), String>,
    /// In-process lookup caches, keyed by name. These outlive sync runs.
    folders: DashMap<String, Folder>,
    sources: DashMap<String, Source>,
}

impl PlatformClient {
    pub fn new(
        pool: Arc<HttpPool>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            pool,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            block_hashes: DashMap::new(),
            folders: DashMap::new(),
            sources: DashMap::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = self.authed(self.pool.client().get(self.url(path)));
        let resp = self.pool.send("platform", req).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    // -- Agents -------------------------------------------------------------

    /// List agents with a server-side filter. All query parameters reach the
    /// wire, including repeated `tags`.
    pub async fn list_agents(&self, query: &AgentQuery) -> Result<Vec<PlatformAgent>> {
        let req = self
            .authed(self.pool.client().get(self.url("/v1/agents")))
            .query(&query.to_pairs());
        let resp = self.pool.send("platform", req).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    /// Exhaustive listing through pagination.
    pub async fn list_agents_all(&self, mut query: AgentQuery) -> Result<Vec<PlatformAgent>> {
        const PAGE: u32 = 100;
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            query.limit = Some(PAGE);
            query.offset = Some(offset);
            let page = self.list_agents(&query).await?;
            let n = page.len() as u32;
            all.extend(page);
            if n < PAGE {
                return Ok(all);
            }
            offset += PAGE;
        }
    }

    pub async fn get_agent(&self, id: &str) -> Result<PlatformAgent> {
        self.get_json(&format!("/v1/agents/{id}")).await
    }

    pub async fn create_agent(&self, req: &CreateAgent) -> Result<PlatformAgent> {
        self.pool.pace().await;
        let rb = self
            .authed(self.pool.client().post(self.url("/v1/agents")))
            .json(req);
        let resp = self.pool.send("platform", rb).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(self.pool.client().delete(self.url(&format!("/v1/agents/{id}"))));
        self.pool.send("platform", req).await?;
        Ok(())
    }

    pub async fn rename_agent(&self, id: &str, name: &str) -> Result<PlatformAgent> {
        self.pool.pace().await;
        let req = self
            .authed(self.pool.client().patch(self.url(&format!("/v1/agents/{id}"))))
            .json(&serde_json::json!({ "name": name }));
        let resp = self.pool.send("platform", req).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    // -- Tools --------------------------------------------------------------

    pub async fn list_agent_tools(&self, agent_id: &str) -> Result<Vec<Tool>> {
        self.get_json(&format!("/v1/agents/{agent_id}/tools")).await
    }

    /// Attach a tool. The platform expects a bodyless `PATCH`; no JSON body
    /// is produced.
    pub async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(
            self.pool
                .client()
                .patch(self.url(&format!("/v1/agents/{agent_id}/tools/attach/{tool_id}"))),
        );
        self.pool.send("platform", req).await?;
        Ok(())
    }

    /// Detach a tool; bodyless `PATCH` like attach.
    pub async fn detach_tool(&self, agent_id: &str, tool_id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(
            self.pool
                .client()
                .patch(self.url(&format!("/v1/agents/{agent_id}/tools/detach/{tool_id}"))),
        );
        self.pool.send("platform", req).await?;
        Ok(())
    }

    // -- Memory blocks ------------------------------------------------------

    pub async fn list_blocks(&self, agent_id: &str) -> Result<Vec<MemoryBlock>> {
        self.get_json(&format!("/v1/agents/{agent_id}/core-memory/blocks"))
            .await
    }

    /// Modify a block's value in place -- a single call, preferred over
    /// detach + create + attach.
    pub async fn modify_block(&self, agent_id: &str, label: &str, value: &str) -> Result<MemoryBlock> {
        self.pool.pace().await;
        let req = self
            .authed(self.pool.client().patch(
                self.url(&format!("/v1/agents/{agent_id}/core-memory/blocks/{label}")),
            ))
            .json(&serde_json::json!({ "value": value }));
        let resp = self.pool.send("platform", req).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    pub async fn create_block(&self, label: &str, value: &str) -> Result<MemoryBlock> {
        self.pool.pace().await;
        let req = self
            .authed(self.pool.client().post(self.url("/v1/blocks")))
            .json(&serde_json::json!({ "label": label, "value": value }));
        let resp = self.pool.send("platform", req).await?;
        resp.json().await.map_err(|e| AgentApiError::Parse(e.to_string()))
    }

    pub async fn delete_block(&self, block_id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(self.pool.client().delete(self.url(&format!("/v1/blocks/{block_id}"))));
        self.pool.send("platform", req).await?;
        Ok(())
    }

    /// Attach an existing block to an agent (bodyless `PATCH`).
    pub async fn attach_block(&self, agent_id: &str, block_id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(self.pool.client().patch(self.url(&format!(
            "/v1/agents/{agent_id}/core-memory/blocks/attach/{block_id}"
        ))));
        self.pool.send("platform", req).await?;
        Ok(())
    }

    /// Detach a block from an agent (bodyless `PATCH`).
    pub async fn detach_block(&self, agent_id: &str, block_id: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self.authed(self.pool.client().patch(self.url(&format!(
            "/v1/agents/{agent_id}/core-memory/blocks/detach/{block_id}"
        ))));
        self.pool.send("platform", req).await?;
        Ok(())
    }

    // -- Folders & sources --------------------------------------------------

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        self.get_json("/v1/folders").await
    }

    /// Resolve (or create) the folder with the given name. A `409 Conflict`
    /// on creation falls back to lookup by name, then to a full listing.
    pub async fn ensure_folder(&self, name: &str) -> Result<Folder> {
        if let Some(hit) = self.folders.get(name) {
            return Ok(hit.clone());
        }

        let create = self
            .authed(self.pool.client().post(self.url("/v1/folders")))
            .json(&serde_json::json!({ "name": name }));
        match self.pool.send("platform", create).await {
            Ok(resp) => {
                let folder: Folder = resp
                    .json()
                    .await
                    .map_err(|e| AgentApiError::Parse(e.to_string()))?;
                self.folders.insert(name.to_string(), folder.clone());
                return Ok(folder);
            }
            Err(HttpError::Status(409)) => {
                debug!(name, "folder already exists, resolving by lookup");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(folder) = self.find_folder_by_name(name).await? {
            self.folders.insert(name.to_string(), folder.clone());
            return Ok(folder);
        }
        warn!(name, "conflicting folder could not be located");
        Err(AgentApiError::Conflict(format!("folder {name} unresolvable")))
    }

    async fn find_folder_by_name(&self, name: &str) -> Result<Option<Folder>> {
        // Name-filtered endpoint first, then the plain listing.
        let req = self
            .authed(self.pool.client().get(self.url("/v1/folders")))
            .query(&[("name", name)]);
        if let Ok(resp) = self.pool.send("platform", req).await {
            if let Ok(folders) = resp.json::<Vec<Folder>>().await {
                if let Some(f) = folders.into_iter().find(|f| f.name == name) {
                    return Ok(Some(f));
                }
            }
        }
        let all = self.list_folders().await?;
        Ok(all.into_iter().find(|f| f.name == name))
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.get_json("/v1/sources").await
    }

    /// Resolve (or create) a source by name. On an unresolvable conflict a
    /// placeholder is returned so callers skip the upload instead of
    /// crashing. The platform's vestigial `-root` entries are never matched.
    pub async fn ensure_source(&self, name: &str, embedding: &str) -> Result<Source> {
        if let Some(hit) = self.sources.get(name) {
            return Ok(hit.clone());
        }

        let create = self
            .authed(self.pool.client().post(self.url("/v1/sources")))
            .json(&serde_json::json!({ "name": name, "embedding": embedding }));
        match self.pool.send("platform", create).await {
            Ok(resp) => {
                let source: Source = resp
                    .json()
                    .await
                    .map_err(|e| AgentApiError::Parse(e.to_string()))?;
                self.sources.insert(name.to_string(), source.clone());
                return Ok(source);
            }
            Err(HttpError::Status(409)) => {
                debug!(name, "source already exists, resolving by lookup");
            }
            Err(e) => return Err(e.into()),
        }

        // Fetch by name, then by listing.
        let req = self
            .authed(self.pool.client().get(self.url("/v1/sources")))
            .query(&[("name", name)]);
        if let Ok(resp) = self.pool.send("platform", req).await {
            if let Ok(sources) = resp.json::<Vec<Source>>().await {
                if let Some(s) = sources
                    .into_iter()
                    .find(|s| s.name == name && !s.name.ends_with("-root"))
                {
                    self.sources.insert(name.to_string(), s.clone());
                    return Ok(s);
                }
            }
        }
        if let Ok(all) = self.list_sources().await {
            if let Some(s) = all
                .into_iter()
                .find(|s| s.name == name && !s.name.ends_with("-root"))
            {
                self.sources.insert(name.to_string(), s.clone());
                return Ok(s);
            }
        }

        warn!(name, "conflicting source could not be located, returning placeholder");
        Ok(Source::placeholder(name))
    }

    /// Upload a file into a folder.
    pub async fn upload_file(&self, folder_id: &str, filename: &str, content: &str) -> Result<()> {
        self.pool.pace().await;
        let req = self
            .authed(
                self.pool
                    .client()
                    .post(self.url(&format!("/v1/folders/{folder_id}/upload"))),
            )
            .json(&serde_json::json!({ "filename": filename, "content": content }));
        self.pool.send("platform", req).await?;
        Ok(())
    }

    // -- Content-hash cache -------------------------------------------------

    pub fn cached_block_hash(&self, agent_id: &str, label: &str) -> Option<String> {
        self.block_hashes
            .get(&(agent_id.to_string(), label.to_string()))
            .map(|h| h.clone())
    }

    pub fn remember_block_hash(&self, agent_id: &str, label: &str, hash: &str) {
        self.block_hashes
            .insert((agent_id.to_string(), label.to_string()), hash.to_string());
    }

    /// Drop the agent-scoped cache; invoked at the end of every sync run.
    pub fn clear_agent_caches(&self) {
        self.block_hashes.clear();
    }

    // -- Startup self-check -------------------------------------------------

    /// Verify the platform honors query parameters by issuing a tag-filtered
    /// listing. If any returned agent lacks the tag, or the filter returned
    /// the entire unfiltered population despite some agents lacking the tag,
    /// intermediary plumbing is stripping query strings and every subsequent
    /// lookup would be wrong -- fail loudly.
    pub async fn verify_query_params(&self, tag: &str) -> Result<()> {
        let filtered = self
            .list_agents(&AgentQuery::by_tags(vec![tag.to_string()], true))
            .await?;
        if let Some(stray) = filtered.iter().find(|a| !a.tags.iter().any(|t| t == tag)) {
            return Err(AgentApiError::Contract(format!(
                "tag filter not honored: agent {} returned without tag {tag}",
                stray.id
            )));
        }
        debug!(tag, count = filtered.len(), "query parameter self-check passed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as AxPath, RawQuery};
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use tokio_util::sync::CancellationToken;

    async fn serve(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    fn client_for(base: &str) -> PlatformClient {
        let pool = Arc::new(HttpPool::new(CancellationToken::new(), 0));
        PlatformClient::new(pool, base, Some("key-1".to_string()))
    }

    #[test]
    fn agent_query_preserves_every_parameter() {
        let q = AgentQuery {
            name: Some("Sync-ACME-PM".into()),
            tags: vec!["vibe-sync".into(), "project:ACME".into()],
            match_all_tags: true,
            limit: Some(50),
            offset: Some(100),
            include: Some("tools".into()),
            order: Some("created_at".into()),
        };
        let pairs = q.to_pairs();
        assert!(pairs.contains(&("name".into(), "Sync-ACME-PM".into())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "tags").count(), 2);
        assert!(pairs.contains(&("match_all_tags".into(), "true".into())));
        assert!(pairs.contains(&("limit".into(), "50".into())));
        assert!(pairs.contains(&("offset".into(), "100".into())));
        assert!(pairs.contains(&("include".into(), "tools".into())));
        assert!(pairs.contains(&("order".into(), "created_at".into())));
    }

    #[tokio::test]
    async fn list_agents_sends_repeated_tags() {
        let app = Router::new().route(
            "/v1/agents",
            get(|RawQuery(q): RawQuery| async move {
                let q = q.unwrap_or_default();
                assert!(q.contains("tags=vibe-sync"));
                assert!(q.contains("tags=project%3AACME") || q.contains("tags=project:ACME"));
                assert!(q.contains("match_all_tags=true"));
                Json(serde_json::json!([
                    {"id": "a1", "name": "Sync-ACME-PM", "tags": ["vibe-sync", "project:ACME"]}
                ]))
            }),
        );
        let (base, _h) = serve(app).await;

        let agents = client_for(&base)
            .list_agents(&AgentQuery::by_tags(
                vec!["vibe-sync".into(), "project:ACME".into()],
                true,
            ))
            .await
            .unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "Sync-ACME-PM");
    }

    #[tokio::test]
    async fn attach_tool_sends_bodyless_patch() {
        let app = Router::new().route(
            "/v1/agents/{agent}/tools/attach/{tool}",
            patch(|body: String| async move {
                // Empty body, not "" wrapped in JSON and not "null".
                assert_eq!(body, "");
                axum::http::StatusCode::NO_CONTENT
            }),
        );
        let (base, _h) = serve(app).await;

        client_for(&base).attach_tool("a1", "tool-9").await.unwrap();
    }

    #[tokio::test]
    async fn modify_block_patches_value_in_place() {
        let app = Router::new().route(
            "/v1/agents/{agent}/core-memory/blocks/{label}",
            patch(
                |AxPath((agent, label)): AxPath<(String, String)>,
                 Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(agent, "a1");
                    assert_eq!(label, "project");
                    Json(serde_json::json!({
                        "id": "b1", "label": label, "value": body["value"]
                    }))
                },
            ),
        );
        let (base, _h) = serve(app).await;

        let block = client_for(&base)
            .modify_block("a1", "project", "new value")
            .await
            .unwrap();
        assert_eq!(block.value, "new value");
    }

    #[tokio::test]
    async fn ensure_source_handles_409_by_lookup() {
        let app = Router::new()
            .route(
                "/v1/sources",
                post(|| async { axum::http::StatusCode::CONFLICT })
                    .get(|RawQuery(q): RawQuery| async move {
                        if q.unwrap_or_default().contains("name=") {
                            Json(serde_json::json!([
                                {"id": "src-1", "name": "ACME-docs"}
                            ]))
                        } else {
                            Json(serde_json::json!([]))
                        }
                    }),
            );
        let (base, _h) = serve(app).await;

        let client = client_for(&base);
        let source = client.ensure_source("ACME-docs", "emb").await.unwrap();
        assert_eq!(source.id, "src-1");
        assert!(!source.is_placeholder());

        // Second call hits the cache (server would 409 again otherwise).
        let again = client.ensure_source("ACME-docs", "emb").await.unwrap();
        assert_eq!(again.id, "src-1");
    }

    #[tokio::test]
    async fn unresolvable_source_conflict_yields_placeholder() {
        let app = Router::new().route(
            "/v1/sources",
            post(|| async { axum::http::StatusCode::CONFLICT })
                .get(|| async { Json(serde_json::json!([])) }),
        );
        let (base, _h) = serve(app).await;

        let source = client_for(&base).ensure_source("ghost", "emb").await.unwrap();
        assert!(source.is_placeholder());
        assert_eq!(source.name, "ghost");
    }

    #[tokio::test]
    async fn root_source_entries_are_never_matched() {
        let app = Router::new().route(
            "/v1/sources",
            post(|| async { axum::http::StatusCode::CONFLICT })
                .get(|| async {
                    Json(serde_json::json!([{"id": "weird", "name": "ACME-root"}]))
                }),
        );
        let (base, _h) = serve(app).await;

        // The only candidate ends with -root; it must be tolerated but not
        // used.
        let source = client_for(&base).ensure_source("ACME-root", "emb").await.unwrap();
        assert!(source.is_placeholder());
    }

    #[tokio::test]
    async fn verify_query_params_detects_dropped_filter() {
        // Server ignores the filter and returns an untagged agent.
        let app = Router::new().route(
            "/v1/agents",
            get(|| async {
                Json(serde_json::json!([
                    {"id": "a1", "name": "Unrelated", "tags": ["other"]}
                ]))
            }),
        );
        let (base, _h) = serve(app).await;

        let err = client_for(&base).verify_query_params("vibe-sync").await.unwrap_err();
        assert!(matches!(err, AgentApiError::Contract(_)));
    }

    #[tokio::test]
    async fn verify_query_params_passes_on_honored_filter() {
        let app = Router::new().route(
            "/v1/agents",
            get(|RawQuery(q): RawQuery| async move {
                assert!(q.unwrap_or_default().contains("tags=vibe-sync"));
                Json(serde_json::json!([
                    {"id": "a1", "name": "Sync-ACME-PM", "tags": ["vibe-sync"]}
                ]))
            }),
        );
        let (base, _h) = serve(app).await;

        client_for(&base).verify_query_params("vibe-sync").await.unwrap();
    }

    #[tokio::test]
    async fn conflict_status_maps_to_conflict_error() {
        let app = Router::new().route(
            "/v1/agents",
            post(|| async { axum::http::StatusCode::CONFLICT }),
        );
        let (base, _h) = serve(app).await;

        let err = client_for(&base)
            .create_agent(&CreateAgent {
                name: "Sync-ACME-PM".into(),
                tags: vec![],
                model: "m".into(),
                embedding: "e".into(),
                memory_blocks: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentApiError::Conflict(_)));
    }

    #[test]
    fn block_hash_cache_roundtrip_and_clear() {
        let client = client_for("http://127.0.0.1:1");
        assert!(client.cached_block_hash("a1", "project").is_none());
        client.remember_block_hash("a1", "project", "hash-1");
        assert_eq!(
            client.cached_block_hash("a1", "project").as_deref(),
            Some("hash-1")
        );
        client.clear_agent_caches();
        assert!(client.cached_block_hash("a1", "project").is_none());
    }

    #[tokio::test]
    async fn pagination_walks_all_pages() {
        let app = Router::new().route(
            "/v1/agents",
            get(|RawQuery(q): RawQuery| async move {
                let q = q.unwrap_or_default();
                // Page size is 100; serve one full page then a short one.
                if q.contains("offset=0") {
                    let page: Vec<serde_json::Value> = (0..100)
                        .map(|i| serde_json::json!({"id": format!("a{i}"), "name": "x", "tags": []}))
                        .collect();
                    Json(serde_json::json!(page))
                } else {
                    Json(serde_json::json!([{"id": "last", "name": "x", "tags": []}]))
                }
            }),
        );
        let (base, _h) = serve(app).await;

        let all = client_for(&base)
            .list_agents_all(AgentQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 101);
        assert_eq!(all.last().map(|a| a.id.as_str()), Some("last"));
    }
}
