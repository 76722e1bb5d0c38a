//! Client for the remote worker service.
//!
//! Two calls, both carrying the shared credential header:
//! - `POST /submit_task {ip, port, duration}` returns a JSON result
//! - `GET /status` returns `{online_workers: [...]}`

use crate::config::OffloadConfig;
use crate::error::RemoteServiceError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Body of a task submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerTask {
    pub ip: String,
    pub port: u16,
    pub duration: u64,
}

/// Result payload returned by the service on acceptance
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TaskResult {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.task_id, &self.status) {
            (Some(id), Some(status)) => write!(f, "task {} ({})", id, status),
            (Some(id), None) => write!(f, "task {}", id),
            (None, Some(status)) => write!(f, "{}", status),
            (None, None) => write!(f, "accepted"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    online_workers: Vec<Value>,
}

/// Remote execution seam, so callers can be tested without a network
pub trait OffloadService: Send + Sync {
    fn submit(&self, task: &WorkerTask) -> Result<TaskResult, RemoteServiceError>;
    fn fetch_status(&self) -> Result<Vec<String>, RemoteServiceError>;
}

pub struct OffloadClient {
    base_url: String,
    api_key: String,
    api_key_header: String,
    agent: ureq::Agent,
}

impl OffloadClient {
    pub fn new(base_url: &str, api_key: &str, api_key_header: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_key_header: api_key_header.to_string(),
            agent,
        }
    }

    /// Build from config; `None` when no service is configured.
    /// A configured service without a credential is a startup error.
    pub fn from_config(config: &OffloadConfig) -> Result<Option<Self>> {
        let Some(base_url) = &config.base_url else {
            return Ok(None);
        };
        let api_key = config.resolve_api_key().ok_or_else(|| {
            anyhow!(
                "offload.base_url is set but no credential was found (set offload.api_key or ${})",
                config.api_key_env.as_deref().unwrap_or("WARDEN_OFFLOAD_KEY")
            )
        })?;
        Ok(Some(Self::new(
            base_url,
            &api_key,
            &config.api_key_header,
            config.timeout(),
        )))
    }
}

/// Collapse a ureq failure into a one-line description
fn describe(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            format!("status {}: {}", code, body.trim())
        }
        ureq::Error::Transport(t) => format!("request failed: {}", t),
    }
}

impl OffloadService for OffloadClient {
    fn submit(&self, task: &WorkerTask) -> Result<TaskResult, RemoteServiceError> {
        let url = format!("{}/submit_task", self.base_url);
        debug!(%url, ip = %task.ip, port = task.port, "submitting task");

        let body = serde_json::to_value(task)
            .map_err(|e| RemoteServiceError::OffloadFailed(e.to_string()))?;
        let resp = self
            .agent
            .post(&url)
            .set(&self.api_key_header, &self.api_key)
            .send_json(body)
            .map_err(|e| {
                let detail = describe(e);
                warn!("task submission failed: {}", detail);
                RemoteServiceError::OffloadFailed(detail)
            })?;

        if resp.status() != 200 {
            return Err(RemoteServiceError::OffloadFailed(format!(
                "status {}",
                resp.status()
            )));
        }
        resp.into_json::<TaskResult>()
            .map_err(|e| RemoteServiceError::OffloadFailed(format!("bad response body: {}", e)))
    }

    fn fetch_status(&self) -> Result<Vec<String>, RemoteServiceError> {
        let url = format!("{}/status", self.base_url);
        let resp = self
            .agent
            .get(&url)
            .set(&self.api_key_header, &self.api_key)
            .call()
            .map_err(|e| RemoteServiceError::StatusFetchFailed(describe(e)))?;

        if resp.status() != 200 {
            return Err(RemoteServiceError::StatusFetchFailed(format!(
                "status {}",
                resp.status()
            )));
        }
        let status: StatusResponse = resp.into_json().map_err(|e| {
            RemoteServiceError::StatusFetchFailed(format!("bad response body: {}", e))
        })?;

        Ok(status
            .online_workers
            .into_iter()
            .map(|w| match w {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serve one canned HTTP response and hand back the raw request
    fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(v) = line.to_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
                request.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            request.push_str(&String::from_utf8_lossy(&body));

            let mut stream = stream;
            stream.write_all(response.as_bytes()).unwrap();
            request
        });
        (base, handle)
    }

    fn client(base: &str) -> OffloadClient {
        OffloadClient::new(base, "secret", "API-Key", Duration::from_secs(5))
    }

    fn task() -> WorkerTask {
        WorkerTask {
            ip: "10.20.0.5".to_string(),
            port: 8080,
            duration: 60,
        }
    }

    #[test]
    fn test_submit_accepted() {
        let (base, server) = serve_once("200 OK", r#"{"task_id":"t-1","status":"queued","worker":"w2"}"#);
        let result = client(&base).submit(&task()).unwrap();
        assert_eq!(result.task_id.as_deref(), Some("t-1"));
        assert_eq!(result.extra["worker"], "w2");
        assert_eq!(result.to_string(), "task t-1 (queued)");

        let request = server.join().unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /submit_task "));
        assert!(lower.contains("api-key: secret"));
        assert!(request.contains(r#""ip":"10.20.0.5""#));
        assert!(request.contains(r#""port":8080"#));
        assert!(request.contains(r#""duration":60"#));
    }

    #[test]
    fn test_submit_non_200_fails() {
        let (base, server) = serve_once("503 Service Unavailable", r#"{"error":"no workers"}"#);
        let err = client(&base).submit(&task()).unwrap_err();
        match err {
            RemoteServiceError::OffloadFailed(detail) => {
                assert!(detail.contains("503"));
                assert!(detail.contains("no workers"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_submit_accepted_but_not_200() {
        let (base, server) = serve_once("202 Accepted", "{}");
        assert_eq!(
            client(&base).submit(&task()).unwrap_err(),
            RemoteServiceError::OffloadFailed("status 202".to_string())
        );
        server.join().unwrap();
    }

    #[test]
    fn test_submit_transport_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = client(&format!("http://127.0.0.1:{}", port))
            .submit(&task())
            .unwrap_err();
        assert!(matches!(err, RemoteServiceError::OffloadFailed(_)));
    }

    #[test]
    fn test_submit_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let silent = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });
        let client = OffloadClient::new(&base, "secret", "API-Key", Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(client.submit(&task()).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        silent.join().unwrap();
    }

    #[test]
    fn test_fetch_status() {
        let (base, server) = serve_once("200 OK", r#"{"online_workers":["w1","w2"]}"#);
        assert_eq!(client(&base).fetch_status().unwrap(), vec!["w1", "w2"]);
        let request = server.join().unwrap();
        assert!(request.starts_with("GET /status "));
        assert!(request.to_lowercase().contains("api-key: secret"));
    }

    #[test]
    fn test_fetch_status_rejected() {
        let (base, server) = serve_once("401 Unauthorized", r#"{"error":"bad key"}"#);
        let err = client(&base).fetch_status().unwrap_err();
        assert!(matches!(err, RemoteServiceError::StatusFetchFailed(ref d) if d.contains("401")));
        server.join().unwrap();
    }

    #[test]
    fn test_from_config() {
        assert!(OffloadClient::from_config(&OffloadConfig::default())
            .unwrap()
            .is_none());

        let missing_key = OffloadConfig {
            base_url: Some("https://probes.internal.example".to_string()),
            api_key_env: Some("WARDEN_TEST_UNSET_VAR".to_string()),
            ..OffloadConfig::default()
        };
        assert!(OffloadClient::from_config(&missing_key).is_err());

        let with_key = OffloadConfig {
            api_key: Some("k".to_string()),
            ..missing_key
        };
        let client = OffloadClient::from_config(&with_key).unwrap().unwrap();
        assert_eq!(client.base_url, "https://probes.internal.example");
    }
}
