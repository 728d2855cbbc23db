//! HTTP client for the orchestrator daemon.
//!
//! The daemon persists its ephemeral TCP port in `.ve/orchestrator.port`;
//! the client dials 127.0.0.1 at that port. The CLI never opens the state
//! store directly.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use ve_core::project::orchestrator_port_path;
use ve_core::{OrchestratorState, StatusLogEntry, WorkUnit};

/// Default HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("orchestrator daemon is not running\n  → start with: ve orch start")]
    DaemonNotRunning,

    #[error("timed out connecting to the daemon at {addr}")]
    ConnectTimeout { addr: String },

    #[error("daemon error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid response from daemon: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ClientError::DaemonNotRunning
        } else if e.is_timeout() {
            ClientError::ConnectTimeout {
                addr: e.url().map(ToString::to_string).unwrap_or_default(),
            }
        } else {
            ClientError::Http(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Serialize)]
pub struct CreateWorkUnitRequest {
    pub chunk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize)]
pub struct PatchWorkUnitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkUnitResponse {
    work_unit: WorkUnit,
}

#[derive(Debug, Deserialize)]
struct WorkUnitsResponse {
    work_units: Vec<WorkUnit>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: Vec<StatusLogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct AttentionItem {
    #[serde(flatten)]
    pub work_unit: WorkUnit,
    pub blocking_count: i64,
}

#[derive(Debug, Deserialize)]
struct AttentionResponse {
    attention: Vec<AttentionItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    /// Connect to the daemon for a project, via the persisted port file.
    pub fn from_project(project_dir: &Path) -> Result<Self> {
        let port_path = orchestrator_port_path(project_dir);
        let content =
            std::fs::read_to_string(&port_path).map_err(|_| ClientError::DaemonNotRunning)?;
        let port: u16 = content
            .trim()
            .parse()
            .map_err(|_| ClientError::DaemonNotRunning)?;
        Ok(Self::new(&format!("http://127.0.0.1:{port}")))
    }

    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => format!("daemon returned {status}"),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn status(&self) -> Result<OrchestratorState> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Ok(Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?)
    }

    pub async fn list_units(&self, status: Option<&str>) -> Result<Vec<WorkUnit>> {
        let mut url = format!("{}/work-units", self.base_url);
        if let Some(status) = status {
            url.push_str(&format!("?status={}", urlencoding::encode(status)));
        }
        let response = self.http.get(url).send().await?;
        let body: WorkUnitsResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_units)
    }

    pub async fn create_unit(&self, req: &CreateWorkUnitRequest) -> Result<WorkUnit> {
        let response = self
            .http
            .post(format!("{}/work-units", self.base_url))
            .json(req)
            .send()
            .await?;
        let body: WorkUnitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_unit)
    }

    pub async fn get_unit(&self, chunk: &str) -> Result<WorkUnit> {
        let response = self
            .http
            .get(format!(
                "{}/work-units/{}",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .send()
            .await?;
        let body: WorkUnitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_unit)
    }

    pub async fn patch_unit(&self, chunk: &str, req: &PatchWorkUnitRequest) -> Result<WorkUnit> {
        let response = self
            .http
            .patch(format!(
                "{}/work-units/{}",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .json(req)
            .send()
            .await?;
        let body: WorkUnitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_unit)
    }

    pub async fn delete_unit(&self, chunk: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/work-units/{}",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn history(&self, chunk: &str) -> Result<Vec<StatusLogEntry>> {
        let response = self
            .http
            .get(format!(
                "{}/work-units/{}/history",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .send()
            .await?;
        let body: HistoryResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.history)
    }

    pub async fn attention(&self) -> Result<Vec<AttentionItem>> {
        let response = self
            .http
            .get(format!("{}/attention", self.base_url))
            .send()
            .await?;
        let body: AttentionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.attention)
    }

    pub async fn answer(&self, chunk: &str, answer: &str) -> Result<WorkUnit> {
        let response = self
            .http
            .post(format!(
                "{}/work-units/{}/answer",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .json(&serde_json::json!({ "answer": answer }))
            .send()
            .await?;
        let body: WorkUnitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_unit)
    }

    pub async fn resolve(&self, chunk: &str, other_chunk: &str, verdict: &str) -> Result<WorkUnit> {
        let response = self
            .http
            .post(format!(
                "{}/work-units/{}/resolve",
                self.base_url,
                urlencoding::encode(chunk)
            ))
            .json(&serde_json::json!({
                "other_chunk": other_chunk,
                "verdict": verdict,
            }))
            .send()
            .await?;
        let body: WorkUnitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.work_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_port_file_means_daemon_not_running() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Client::from_project(dir.path()),
            Err(ClientError::DaemonNotRunning)
        ));
    }

    #[test]
    fn port_file_builds_localhost_url() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".ve")).unwrap();
        std::fs::write(dir.path().join(".ve/orchestrator.port"), "7171\n").unwrap();
        let client = Client::from_project(dir.path()).unwrap();
        assert_eq!(client.addr(), "http://127.0.0.1:7171");
    }

    #[test]
    fn garbage_port_file_means_daemon_not_running() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".ve")).unwrap();
        std::fs::write(dir.path().join(".ve/orchestrator.port"), "not-a-port\n").unwrap();
        assert!(matches!(
            Client::from_project(dir.path()),
            Err(ClientError::DaemonNotRunning)
        ));
    }
}
