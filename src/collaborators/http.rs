//! reqwest adapters for the reasoning service.
//!
//! Only a connect timeout is set. Executions can legitimately run for a long
//! time and liveness is tracked through heartbeats instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Acceptance, ExecutionBackend, PriorityHint, Qualification, Qualifier};
use crate::error::{ExecutionError, QualificationError};
use crate::task::{ProcessingMode, Task};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body sent to both `/qualify` and `/orchestrate`.
#[derive(Debug, Serialize)]
struct TaskEnvelope<'a> {
    task_id: Uuid,
    task_type: &'a str,
    processing_mode: ProcessingMode,
    correlation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    payload: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<PriorityHint>,
}

impl<'a> TaskEnvelope<'a> {
    fn new(task: &'a Task, priority: Option<PriorityHint>) -> Self {
        Self {
            task_id: task.id,
            task_type: &task.task_type,
            processing_mode: task.processing_mode,
            correlation_id: &task.correlation_id,
            subject_id: task.subject_id.as_deref(),
            summary: task.summary.as_deref(),
            payload: &task.payload,
            priority,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Shared client plumbing.
#[derive(Clone)]
struct ServiceClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl ServiceClient {
    fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

/// Extract a readable reason from an error response.
async fn error_reason(resp: reqwest::Response) -> String {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or(text);
    if reason.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {reason}")
    }
}

/// `Qualifier` backed by `POST {base}/qualify`.
pub struct HttpQualifier {
    inner: ServiceClient,
}

impl HttpQualifier {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            inner: ServiceClient::new(base_url, token)?,
        })
    }
}

#[async_trait]
impl Qualifier for HttpQualifier {
    async fn qualify(&self, task: &Task) -> Result<Qualification, QualificationError> {
        let resp = self
            .inner
            .post("/qualify")
            .json(&TaskEnvelope::new(task, None))
            .send()
            .await
            .map_err(|e| QualificationError::retriable(format!("qualify request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<Qualification>().await.map_err(|e| {
                QualificationError::retriable(format!("qualify response unreadable: {e}"))
            });
        }

        let reason = error_reason(resp).await;
        // 4xx other than throttling means the task itself is unusable
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(QualificationError::permanent(reason))
        } else {
            Err(QualificationError::retriable(reason))
        }
    }
}

/// `ExecutionBackend` backed by `POST {base}/orchestrate`.
pub struct HttpExecutionBackend {
    inner: ServiceClient,
}

impl HttpExecutionBackend {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            inner: ServiceClient::new(base_url, token)?,
        })
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutionBackend {
    async fn accept(&self, task: &Task, priority: PriorityHint) -> Result<Acceptance, ExecutionError> {
        let resp = self
            .inner
            .post("/orchestrate")
            .json(&TaskEnvelope::new(task, Some(priority)))
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(Acceptance::Accepted),
            StatusCode::TOO_MANY_REQUESTS => Ok(Acceptance::Busy),
            StatusCode::SERVICE_UNAVAILABLE => Ok(Acceptance::Unavailable(error_reason(resp).await)),
            s if s.is_client_error() => Err(ExecutionError::Rejected(error_reason(resp).await)),
            _ => Err(ExecutionError::Transport(error_reason(resp).await)),
        }
    }

    async fn cancel(&self, task_id: Uuid) -> Result<(), ExecutionError> {
        let resp = self
            .inner
            .post(&format!("/orchestrate/{task_id}/cancel"))
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        // Already finished is as good as cancelled
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ExecutionError::Transport(error_reason(resp).await))
        }
    }
}
