//! HTTP client for gsastd.
//!
//! Talks to gsastd's control plane (Section 6.1) over plain HTTP, presenting
//! the same `X-API-Secret-Key` header every route checks.

use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gsastd not reachable at {addr}\n  → start it with: gsastd\n  → or pass --addr / set GSASTD_ADDR")]
    ConnectionFailed { addr: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("forbidden: check --token or the GSASTD_TOKEN env var against the daemon's API_SECRET_KEY")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuleFileWire {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct StartScanRequest {
    config: Value,
    rule_files: Vec<RuleFileWire>,
}

#[derive(Debug, Deserialize)]
struct StartScanResponse {
    scan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanInfo {
    pub scan_id: String,
    pub message: String,
    pub jobs: std::collections::HashMap<String, usize>,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ScansListResponse {
    scans: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectsListResponse {
    projects: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: String,
}

pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert("X-API-Secret-Key", value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            403 => ClientError::Forbidden,
            404 => ClientError::NotFound(message),
            400 => ClientError::BadRequest(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    /// `POST /scan`.
    pub async fn start_scan(&self, config: Value, rule_files: Vec<RuleFileWire>) -> Result<String, ClientError> {
        let url = format!("{}/scan", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&StartScanRequest { config, rule_files })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: StartScanResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.scan_id)
    }

    /// `GET /scan/{id}/status`.
    pub async fn get_status(&self, scan_id: &str) -> Result<ScanInfo, ClientError> {
        let url = format!("{}/scan/{}/status", self.base_url, scan_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /scan/{id}/results`, returned as a raw JSON document since its
    /// shape (per-project, per-scanner SARIF) is dynamic.
    pub async fn get_results(
        &self,
        scan_id: &str,
        project: Option<&str>,
        scanner: Option<&str>,
        query: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut url = format!("{}/scan/{}/results", self.base_url, scan_id);
        let mut params = Vec::new();
        if let Some(p) = project {
            params.push(format!("project={}", urlencoding::encode(p)));
        }
        if let Some(s) = scanner {
            params.push(format!("scan={}", urlencoding::encode(s)));
        }
        if let Some(q) = query {
            params.push(format!("query={}", urlencoding::encode(q)));
        }
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }

        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /queue/scans`.
    pub async fn list_scans(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/queue/scans", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: ScansListResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.scans)
    }

    /// `GET /queue/projects`.
    pub async fn list_projects(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/queue/projects", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: ProjectsListResponse =
            response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.projects)
    }

    /// `DELETE /queue/cleanup`.
    pub async fn cleanup_queues(&self) -> Result<String, ClientError> {
        let url = format!("{}/queue/cleanup", self.base_url);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: MessageResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.message)
    }

    /// `DELETE /queue/projects`.
    pub async fn cleanup_projects(&self) -> Result<String, ClientError> {
        let url = format!("{}/queue/projects", self.base_url);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: MessageResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:5000/", None);
        assert_eq!(client.base_url, "http://localhost:5000");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:5000", None);
        assert_eq!(client.base_url, "http://localhost:5000");
    }

    #[test]
    fn client_headers_include_token_when_set() {
        let client = Client::new("http://localhost:5000", Some("shh"));
        let headers = client.headers();
        assert_eq!(headers.get("X-API-Secret-Key").unwrap(), "shh");
    }

    #[test]
    fn client_headers_omit_token_when_absent() {
        let client = Client::new("http://localhost:5000", None);
        let headers = client.headers();
        assert!(headers.get("X-API-Secret-Key").is_none());
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:5000", None);
        assert_eq!(client.addr(), "http://localhost:5000");
    }

    #[tokio::test]
    async fn connection_to_closed_port_fails() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.list_scans().await;
        assert!(result.is_err());
    }

    #[test]
    fn forbidden_error_message_mentions_token() {
        let msg = ClientError::Forbidden.to_string();
        assert!(msg.contains("GSASTD_TOKEN"));
    }
}
