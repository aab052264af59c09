use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CursorBotError;
use cursorbot_core::task::TaskStatus;

pub const MODELS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const REPOSITORIES_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

// --- Wire types ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDimension {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptImage {
    /// Base64 payload.
    pub data: String,
    pub dimension: ImageDimension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PromptImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSource {
    pub repository: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateAgentRequest {
    pub prompt: Prompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub source: AgentSource,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTarget {
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
}

/// A remote background agent ("task").
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<AgentSource>,
    #[serde(default)]
    pub target: Option<AgentTarget>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Agent {
    /// Link to the agent in the Cursor web UI.
    pub fn web_url(&self) -> String {
        self.target
            .as_ref()
            .and_then(|t| t.url.clone())
            .unwrap_or_else(|| agent_web_url(&self.id))
    }
}

pub fn agent_web_url(agent_id: &str) -> String {
    format!("https://cursor.com/agents?id={agent_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
    #[serde(alias = "repository")]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoriesResponse {
    #[serde(default)]
    repositories: Vec<Repository>,
}

#[derive(Debug, Serialize)]
struct FollowupRequest<'a> {
    prompt: FollowupPrompt<'a>,
}

#[derive(Debug, Serialize)]
struct FollowupPrompt<'a> {
    text: &'a str,
}

// --- Response cache ---

struct CacheEntry {
    value: serde_json::Value,
    fetched_at: Instant,
}

type CacheSlot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Memoizes remote list calls per key. A miss holds the key's guard while
/// fetching, so concurrent misses for the same key issue one request.
#[derive(Default)]
pub struct ResponseCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> CacheSlot {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(key.to_string()).or_default().clone()
    }

    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<T, CursorBotError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CursorBotError>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < ttl {
                debug!("Cursor cache hit: {key}");
                return Ok(serde_json::from_value(entry.value.clone())?);
            }
        }

        let value = fetch().await?;
        *guard = Some(CacheEntry {
            value: serde_json::to_value(&value)?,
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}

// --- Client ---

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn create_agent(&self, request: &CreateAgentRequest) -> Result<Agent, CursorBotError>;
    async fn get_agent(&self, agent_id: &str) -> Result<Agent, CursorBotError>;
    /// Returns the id of the deleted agent.
    async fn delete_agent(&self, agent_id: &str) -> Result<String, CursorBotError>;
    async fn add_followup(&self, agent_id: &str, text: &str) -> Result<String, CursorBotError>;
    async fn list_models(&self) -> Result<Vec<String>, CursorBotError>;
    async fn list_repositories(&self) -> Result<Vec<Repository>, CursorBotError>;
}

pub struct CursorClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    cache: ResponseCache,
}

impl CursorClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CursorBotError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: ResponseCache::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CursorBotError> {
        Self::new(
            config.cursor_api_key.clone(),
            config.cursor_api_base_url.clone(),
            Duration::from_secs(config.cursor_request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, CursorBotError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = extract_error_message(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").into());
            warn!("Cursor API error {}: {message}", status.as_u16());
            return Err(CursorBotError::RemoteApi {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let from_json = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| {
            let error = value.get("error").unwrap_or(&value);
            error
                .as_str()
                .or_else(|| error.get("message").and_then(|m| m.as_str()))
                .map(str::to_string)
        });
    Some(from_json.unwrap_or_else(|| trimmed.to_string()))
}

#[async_trait]
impl TaskApi for CursorClient {
    async fn create_agent(&self, request: &CreateAgentRequest) -> Result<Agent, CursorBotError> {
        self.send(self.http.post(self.url("/v0/agents")).json(request))
            .await
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Agent, CursorBotError> {
        self.send(self.http.get(self.url(&format!("/v0/agents/{agent_id}"))))
            .await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<String, CursorBotError> {
        let resp: IdResponse = self
            .send(self.http.delete(self.url(&format!("/v0/agents/{agent_id}"))))
            .await?;
        Ok(resp.id)
    }

    async fn add_followup(&self, agent_id: &str, text: &str) -> Result<String, CursorBotError> {
        let body = FollowupRequest {
            prompt: FollowupPrompt { text },
        };
        let resp: IdResponse = self
            .send(
                self.http
                    .post(self.url(&format!("/v0/agents/{agent_id}/followup")))
                    .json(&body),
            )
            .await?;
        Ok(resp.id)
    }

    async fn list_models(&self) -> Result<Vec<String>, CursorBotError> {
        self.cache
            .get_or_fetch("models", MODELS_CACHE_TTL, move || async move {
                let resp: ModelsResponse = self.send(self.http.get(self.url("/v0/models"))).await?;
                Ok(resp.models)
            })
            .await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, CursorBotError> {
        self.cache
            .get_or_fetch("repositories", REPOSITORIES_CACHE_TTL, move || async move {
                let resp: RepositoriesResponse = self
                    .send(self.http.get(self.url("/v0/repositories")))
                    .await?;
                Ok(resp.repositories)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CursorClient {
        CursorClient::new("cur-key", server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn agent_json(id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "status": status,
            "name": "Add login page",
            "source": {"repository": "https://github.com/a/b", "ref": "main"},
            "target": {"branchName": "cursor/login", "url": format!("https://cursor.com/agents?id={id}")},
            "createdAt": "2025-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_create_agent_sends_prompt_images_and_source() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v0/agents"))
            .and(header("authorization", "Bearer cur-key"))
            .and(body_json(json!({
                "prompt": {
                    "text": "build a login page",
                    "images": [{"data": "aGVsbG8=", "dimension": {"width": 10, "height": 20}}]
                },
                "model": "claude-4-sonnet",
                "source": {"repository": "https://github.com/a/b", "ref": "main"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(agent_json("bc-1", "CREATING")))
            .expect(1)
            .mount(&server)
            .await;

        let request = CreateAgentRequest {
            prompt: Prompt {
                text: "build a login page".into(),
                images: vec![PromptImage {
                    data: "aGVsbG8=".into(),
                    dimension: ImageDimension {
                        width: 10,
                        height: 20,
                    },
                }],
            },
            model: Some("claude-4-sonnet".into()),
            source: AgentSource {
                repository: "https://github.com/a/b".into(),
                git_ref: Some("main".into()),
            },
        };
        let agent = client_for(&server).create_agent(&request).await.unwrap();
        assert_eq!(agent.id, "bc-1");
        assert_eq!(agent.status, TaskStatus::Creating);
        assert_eq!(agent.web_url(), "https://cursor.com/agents?id=bc-1");
    }

    #[test]
    fn test_create_request_omits_empty_optionals() {
        let request = CreateAgentRequest {
            prompt: Prompt {
                text: "x".into(),
                images: vec![],
            },
            model: None,
            source: AgentSource {
                repository: "https://github.com/a/b".into(),
                git_ref: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["prompt"].get("images").is_none());
        assert!(value.get("model").is_none());
        assert!(value["source"].get("ref").is_none());
    }

    #[tokio::test]
    async fn test_get_agent_tolerates_unknown_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/agents/bc-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "bc-2", "status": "PAUSED"})),
            )
            .mount(&server)
            .await;

        let agent = client_for(&server).get_agent("bc-2").await.unwrap();
        assert_eq!(agent.status, TaskStatus::Other("PAUSED".into()));
        assert_eq!(agent.web_url(), agent_web_url("bc-2"));
    }

    #[tokio::test]
    async fn test_non_2xx_maps_to_remote_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/agents/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "Agent not found"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).get_agent("missing").await.unwrap_err();
        match err {
            CursorBotError::RemoteApi { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Agent not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_and_followup_return_ids() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v0/agents/bc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "bc-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v0/agents/bc-1/followup"))
            .and(body_json(json!({"prompt": {"text": "also add tests"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "bc-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.delete_agent("bc-1").await.unwrap(), "bc-1");
        assert_eq!(
            client.add_followup("bc-1", "also add tests").await.unwrap(),
            "bc-1"
        );
    }

    #[tokio::test]
    async fn test_list_models_is_cached_per_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"models": ["claude-4-sonnet", "gpt-5"]})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.list_models().await.unwrap().len(), 2);
        assert_eq!(client.list_models().await.unwrap().len(), 2);
        // A fresh instance has its own cache
        let other = client_for(&server);
        assert_eq!(other.list_models().await.unwrap()[1], "gpt-5");
    }

    #[tokio::test]
    async fn test_list_repositories_accepts_repository_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "repositories": [
                    {"owner": "a", "name": "b", "repository": "https://github.com/a/b"},
                    {"owner": "c", "name": "d", "url": "https://github.com/c/d"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let repos = client_for(&server).list_repositories().await.unwrap();
        assert_eq!(repos[0].url, "https://github.com/a/b");
        assert_eq!(repos[1].owner, "c");
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/models"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": ["m"]})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.list_models().await.is_err());
        assert_eq!(client.list_models().await.unwrap(), vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn test_response_cache_dedups_concurrent_misses() {
        let cache = ResponseCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, CursorBotError>(vec!["m".to_string()])
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch("models", MODELS_CACHE_TTL, fetch),
            cache.get_or_fetch("models", MODELS_CACHE_TTL, fetch),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_response_cache_expiry() {
        let cache = ResponseCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move { Ok::<_, CursorBotError>(calls.fetch_add(1, Ordering::SeqCst)) };

        assert_eq!(
            cache.get_or_fetch("k", Duration::ZERO, fetch).await.unwrap(),
            0
        );
        assert_eq!(
            cache.get_or_fetch("k", Duration::ZERO, fetch).await.unwrap(),
            1
        );
        assert_eq!(
            cache
                .get_or_fetch("k", Duration::from_secs(60), fetch)
                .await
                .unwrap(),
            1
        );
    }
}
