//! Remote recruiting-ERP API boundary: trait contract + JSON/HTTP client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use jobsync_core::{Credentials, EntityKind, ExternalId, QueryFilter, RemoteSession};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobsync-remote";

/// Largest id batch the remote `find-multiple` call accepts.
pub const MAX_FIND_MULTIPLE: usize = 20;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("remote fault: {0}")]
    Fault(String),
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("session endpoint unreachable: {0}")]
    Unreachable(#[source] RemoteError),
}

#[derive(Debug, Error)]
#[error("identifier query failed: {0}")]
pub struct QueryError(#[from] pub RemoteError);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("batch of {len} ids exceeds the remote maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error("find-multiple failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Request/response contract the sync pipeline needs from the remote system.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn start_session(&self, credentials: &Credentials) -> Result<RemoteSession, AuthError>;

    async fn query_ids(
        &self,
        session: &RemoteSession,
        entity: EntityKind,
        filter: &QueryFilter,
        distinct: bool,
    ) -> Result<Vec<ExternalId>, QueryError>;

    /// Full record bodies for at most [`MAX_FIND_MULTIPLE`] ids, in remote order.
    async fn find_multiple(
        &self,
        session: &RemoteSession,
        entity: EntityKind,
        ids: &[ExternalId],
    ) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl RemoteClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    username: &'a str,
    password: &'a str,
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session: String,
    #[serde(default)]
    expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    session: &'a str,
    entity_name: &'a str,
    #[serde(rename = "where")]
    where_clause: &'a str,
    distinct: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<ExternalId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindMultipleRequest<'a> {
    session: &'a str,
    entity_name: &'a str,
    ids: &'a [ExternalId],
}

#[derive(Debug, Deserialize)]
struct FindMultipleResponse {
    #[serde(default)]
    dtos: Vec<JsonValue>,
}

/// JSON-over-HTTP client with per-call timeout and bounded retries.
#[derive(Debug)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpRemoteClient {
    pub fn new(config: RemoteClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<B, T>(&self, operation: &'static str, path: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let span = info_span!("remote_call", operation, url = %url);
        async {
            let mut attempt = 0usize;
            loop {
                match self.client.post(&url).json(body).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return match resp.bytes().await {
                                Ok(bytes) => decode_body(&url, &bytes),
                                Err(err) => Err(RemoteError::Transport(err)),
                            };
                        }

                        let message = fault_message(&resp.text().await.unwrap_or_default());
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, status = status.as_u16(), "retrying remote call");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(RemoteError::HttpStatus {
                            status: status.as_u16(),
                            url: url.clone(),
                            message,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying remote call");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(RemoteError::Transport(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn decode_body<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, RemoteError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| RemoteError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    if let Some(fault) = value.get("fault") {
        return Err(RemoteError::Fault(fault_text(fault)));
    }
    serde_json::from_value(value).map_err(|e| RemoteError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn fault_text(fault: &JsonValue) -> String {
    match fault {
        JsonValue::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

/// Human-readable message from an error body: the `fault` field when present, else the raw text.
fn fault_message(body: &str) -> String {
    let parsed = serde_json::from_str::<JsonValue>(body).ok();
    if let Some(fault) = parsed.as_ref().and_then(|v| v.get("fault")) {
        return fault_text(fault);
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        trimmed.chars().take(200).collect::<String>() + "..."
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteClient {
    async fn start_session(&self, credentials: &Credentials) -> Result<RemoteSession, AuthError> {
        let request = SessionRequest {
            username: &credentials.username,
            password: &credentials.password,
            api_key: &credentials.api_key,
        };
        let response: SessionResponse = match self.post_json("start_session", "session", &request).await {
            Ok(response) => response,
            Err(RemoteError::HttpStatus {
                status: 401 | 403,
                message,
                ..
            }) => return Err(AuthError::Rejected(message)),
            Err(RemoteError::Fault(message)) => return Err(AuthError::Rejected(message)),
            Err(err) => return Err(AuthError::Unreachable(err)),
        };

        let established_at = Utc::now();
        let expires_at = response
            .expires_in_seconds
            .and_then(chrono::Duration::try_seconds)
            .map(|ttl| established_at + ttl);
        Ok(RemoteSession {
            token: response.session,
            established_at,
            expires_at,
        })
    }

    async fn query_ids(
        &self,
        session: &RemoteSession,
        entity: EntityKind,
        filter: &QueryFilter,
        distinct: bool,
    ) -> Result<Vec<ExternalId>, QueryError> {
        let request = QueryRequest {
            session: &session.token,
            entity_name: entity.as_str(),
            where_clause: &filter.where_clause,
            distinct,
        };
        let response: QueryResponse = self.post_json("query", "query", &request).await?;
        Ok(response.ids)
    }

    async fn find_multiple(
        &self,
        session: &RemoteSession,
        entity: EntityKind,
        ids: &[ExternalId],
    ) -> Result<Vec<JsonValue>, FetchError> {
        if ids.len() > MAX_FIND_MULTIPLE {
            return Err(FetchError::BatchTooLarge {
                len: ids.len(),
                max: MAX_FIND_MULTIPLE,
            });
        }
        let request = FindMultipleRequest {
            session: &session.token,
            entity_name: entity.as_str(),
            ids,
        };
        let response: FindMultipleResponse =
            self.post_json("find_multiple", "find-multiple", &request).await?;
        Ok(response.dtos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard, max_retries: usize) -> HttpRemoteClient {
        HttpRemoteClient::new(RemoteClientConfig {
            base_url: server.url(),
            timeout: Duration::from_secs(5),
            user_agent: Some("jobsync-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        })
        .expect("client")
    }

    fn session() -> RemoteSession {
        RemoteSession {
            token: "tok-1".into(),
            established_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn fault_message_prefers_fault_field() {
        assert_eq!(fault_message(r#"{"fault":"Invalid API key"}"#), "Invalid API key");
        assert_eq!(
            fault_message(r#"{"fault":{"message":"Session expired"}}"#),
            "Session expired"
        );
        assert_eq!(fault_message("  gateway down "), "gateway down");
    }

    #[tokio::test]
    async fn start_session_returns_token_and_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/session")
            .match_body(Matcher::Json(json!({
                "username": "recruiter",
                "password": "pw",
                "apiKey": "key"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"session":"abc123","expiresInSeconds":600}"#)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let session = client
            .start_session(&Credentials::new("recruiter", "pw", "key"))
            .await
            .expect("session");

        mock.assert_async().await;
        assert_eq!(session.token, "abc123");
        let ttl = session.expires_at.expect("expiry") - session.established_at;
        assert_eq!(ttl.num_seconds(), 600);
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/session")
            .with_status(401)
            .with_body(r#"{"fault":"Invalid username or password"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, 3);
        let err = client
            .start_session(&Credentials::new("recruiter", "wrong", "key"))
            .await
            .unwrap_err();

        mock.assert_async().await;
        match err {
            AuthError::Rejected(message) => assert_eq!(message, "Invalid username or password"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_sends_filter_and_distinct_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/query")
            .match_body(Matcher::Json(json!({
                "session": "tok-1",
                "entityName": "JobOrder",
                "where": "isOpen=1",
                "distinct": true
            })))
            .with_status(200)
            .with_body(r#"{"ids":[101,102,102,103]}"#)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let ids = client
            .query_ids(&session(), EntityKind::JobOrder, &QueryFilter::open(), true)
            .await
            .expect("ids");

        mock.assert_async().await;
        assert_eq!(ids, vec![101, 102, 102, 103]);
    }

    #[tokio::test]
    async fn server_errors_retry_until_budget_is_spent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/find-multiple")
            .with_status(503)
            .with_body("maintenance")
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server, 2);
        let err = client
            .find_multiple(&session(), EntityKind::JobOrder, &[1, 2])
            .await
            .unwrap_err();

        mock.assert_async().await;
        match err {
            FetchError::Remote(RemoteError::HttpStatus { status, message, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn fault_in_success_body_surfaces_as_fault() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/find-multiple")
            .with_status(200)
            .with_body(r#"{"fault":{"message":"Entity not found"}}"#)
            .create_async()
            .await;

        let client = client_for(&server, 0);
        let err = client
            .find_multiple(&session(), EntityKind::JobOrder, &[7])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Remote(RemoteError::Fault(ref m)) if m == "Entity not found"));
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected_locally() {
        let server = mockito::Server::new_async().await;
        let client = client_for(&server, 0);
        let ids: Vec<ExternalId> = (1..=21).collect();
        let err = client
            .find_multiple(&session(), EntityKind::JobOrder, &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BatchTooLarge { len: 21, max: 20 }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_transport_failure() {
        let client = HttpRemoteClient::new(RemoteClientConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout: Duration::from_secs(2),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        })
        .expect("client");

        let err = client
            .query_ids(&session(), EntityKind::JobOrder, &QueryFilter::open(), true)
            .await
            .unwrap_err();
        assert!(matches!(err.0, RemoteError::Transport(_)));
        let message = err.to_string();
        assert!(message.starts_with("identifier query failed: request failed:"), "{message}");
        assert!(!message.contains("after retries"), "{message}");
    }
}

