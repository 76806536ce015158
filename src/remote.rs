use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::entities::{bagup, project, supervisor, tally, tally_session};
use crate::error::AppError;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Non-2xx response; the message is the response body when there is one.
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// One remote submission across all three record kinds.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncBatch {
    pub tallies: Vec<tally::Model>,
    pub sessions: Vec<tally_session::Model>,
    pub bagups: Vec<bagup::Model>,
}

impl SyncBatch {
    pub fn len(&self) -> usize {
        self.tallies.len() + self.sessions.len() + self.bagups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RemoteProject {
    pub project_name: String,
    #[serde(default)]
    pub species_data: Value,
    #[serde(default)]
    pub blocks_data: Value,
}

impl From<RemoteProject> for project::Model {
    fn from(value: RemoteProject) -> Self {
        Self {
            project_name: value.project_name,
            species_data: value.species_data,
            blocks_data: value.blocks_data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RemoteSupervisor {
    pub name: String,
    #[serde(default)]
    pub project_name: Option<String>,
}

impl From<RemoteSupervisor> for supervisor::Model {
    fn from(value: RemoteSupervisor) -> Self {
        Self {
            name: value.name,
            project_name: value.project_name,
        }
    }
}

/// The service tallies are reconciled against. A batch is accepted or rejected
/// as a whole; re-sending accepted records must be a no-op on the remote side.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<(), RemoteError>;
    async fn fetch_projects(&self) -> Result<Vec<RemoteProject>, RemoteError>;
    async fn fetch_supervisors(&self) -> Result<Vec<RemoteSupervisor>, RemoteError>;
}

pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::InvalidInput(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base.as_str().trim_end_matches('/'))
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transport(err.to_string())
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            format!("Request failed with status {}", status.as_u16())
        } else {
            body.trim().to_string()
        };
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = self.check(response).await?;
        response.json::<T>().await.map_err(|err| {
            if err.is_timeout() {
                RemoteError::Timeout(self.timeout)
            } else {
                RemoteError::Decode(err.to_string())
            }
        })
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.endpoint("tallies/batch"))
            .json(batch)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        self.check(response).await?;
        Ok(())
    }

    async fn fetch_projects(&self) -> Result<Vec<RemoteProject>, RemoteError> {
        self.get_json("projects").await
    }

    async fn fetch_supervisors(&self) -> Result<Vec<RemoteSupervisor>, RemoteError> {
        self.get_json("supervisors").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves exactly one canned HTTP response and hands back the raw request.
    async fn serve_once(status_line: &str, body: &str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = socket.read(&mut buf).await.expect("read");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        let url = Url::parse(&format!("http://127.0.0.1:{port}/api/")).expect("url");
        (url, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        raw.len() >= split + 4 + length
    }

    #[tokio::test]
    async fn submit_batch_posts_all_kinds() {
        let (url, handle) = serve_once("200 OK", "").await;
        let remote = HttpRemote::new(url, Duration::from_secs(5)).expect("remote");
        remote
            .submit_batch(&SyncBatch::default())
            .await
            .expect("submit");
        let request = handle.await.expect("join");
        assert!(request.starts_with("POST /api/tallies/batch "));
        assert!(request.contains("\"tallies\":[]"));
        assert!(request.contains("\"sessions\":[]"));
        assert!(request.contains("\"bagups\":[]"));
    }

    #[tokio::test]
    async fn rejected_batch_carries_response_body() {
        let (url, handle) = serve_once("422 Unprocessable Entity", "block not found").await;
        let remote = HttpRemote::new(url, Duration::from_secs(5)).expect("remote");
        let err = remote
            .submit_batch(&SyncBatch::default())
            .await
            .unwrap_err();
        handle.await.expect("join");
        match err {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "block not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_batch_without_body_reports_status() {
        let (url, handle) = serve_once("503 Service Unavailable", "").await;
        let remote = HttpRemote::new(url, Duration::from_secs(5)).expect("remote");
        let err = remote
            .submit_batch(&SyncBatch::default())
            .await
            .unwrap_err();
        handle.await.expect("join");
        assert_eq!(err.to_string(), "Request failed with status 503");
    }

    #[tokio::test]
    async fn fetch_projects_decodes_payload() {
        let body = concat!(
            r#"[{"project_name":"North","species_data":{"pl":"Pine"},"#,
            r#""blocks_data":["A1"]}]"#
        );
        let (url, handle) = serve_once("200 OK", body).await;
        let remote = HttpRemote::new(url, Duration::from_secs(5)).expect("remote");
        let projects = remote.fetch_projects().await.expect("fetch");
        let request = handle.await.expect("join");
        assert!(request.starts_with("GET /api/projects "));
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_name, "North");
        assert_eq!(projects[0].species_data["pl"], "Pine");
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).expect("url");
        let remote = HttpRemote::new(url, Duration::from_secs(1)).expect("remote");
        let err = remote
            .submit_batch(&SyncBatch::default())
            .await
            .unwrap_err();
        silent.abort();
        assert!(matches!(
            err,
            RemoteError::Timeout(duration) if duration == Duration::from_secs(1)
        ));
        assert_eq!(err.to_string(), "Request timed out after 1s");
    }

    #[test]
    fn timeout_message_is_distinct() {
        let err = RemoteError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Request timed out after 30s");
    }
}
