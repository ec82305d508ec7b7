//! Thin wrapper around the remote auto-segmentation HTTP API, per spec.md §6.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub task_id: String,
}

pub struct DownloadResponse {
    pub bytes: bytes::Bytes,
    pub checksum_header: Option<String>,
}

pub struct RemoteSegmentationClient {
    client: reqwest::Client,
    base_url: String,
    upload_endpoint: String,
    status_endpoint: String,
    download_endpoint: String,
    notify_endpoint: String,
}

impl RemoteSegmentationClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        upload_endpoint: String,
        status_endpoint: String,
        download_endpoint: String,
        notify_endpoint: String,
    ) -> Self {
        Self {
            client,
            base_url,
            upload_endpoint,
            status_endpoint,
            download_endpoint,
            notify_endpoint,
        }
    }

    fn endpoint(&self, template: &str, task_id: &str) -> String {
        format!("{}{}", self.base_url, template.replace("{task_id}", task_id))
    }

    pub async fn upload(
        &self,
        token: &str,
        zip_bytes: Vec<u8>,
        zip_sha256: &str,
    ) -> Result<UploadResponse, reqwest::Error> {
        let part = reqwest::multipart::Part::bytes(zip_bytes).file_name("export.zip");
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("checksum", zip_sha256.to_string());
        let url = format!("{}{}", self.base_url, self.upload_endpoint);
        self.client
            .post(&url)
            .bearer_auth(token)
            .multipart(form)
            .timeout(Duration::from_secs(300))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn status(&self, token: &str, task_id: &str) -> Result<StatusResponse, reqwest::Error> {
        let url = self.endpoint(&self.status_endpoint, task_id);
        self.client
            .get(&url)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn download(&self, token: &str, task_id: &str) -> Result<DownloadResponse, reqwest::Error> {
        let url = self.endpoint(&self.download_endpoint, task_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(Duration::from_secs(300))
            .send()
            .await?
            .error_for_status()?;
        let checksum_header = response
            .headers()
            .get("X-File-Checksum")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok(DownloadResponse { bytes, checksum_header })
    }

    pub async fn notify(&self, token: &str, task_id: &str, status: &str, timestamp: &str) -> Result<String, reqwest::Error> {
        let url = format!("{}{}", self.base_url, self.notify_endpoint);
        let body = serde_json::json!({ "task_id": task_id, "status": status, "timestamp": timestamp });
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        response.text().await
    }

    pub async fn health(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let url = format!("{}api/health", self.base_url);
        let response = self.client.get(&url).timeout(Duration::from_secs(10)).send().await?;
        Ok(response.status())
    }

    /// Informational only: the template editor (outside this crate) is the
    /// only consumer. Fetched here so its bearer auth is centralized.
    pub async fn list_templates(&self, token: &str) -> Result<Vec<TemplateSummary>, reqwest::Error> {
        let url = format!("{}api/models/", self.base_url);
        self.client
            .get(&url)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[derive(Debug, Deserialize)]
pub struct TemplateSummary {
    pub name: String,
    #[serde(default)]
    pub modelmap: Vec<serde_json::Value>,
}

/// Response body confirming a successful notify, per spec.md §4.7 step (g).
pub const NOTIFY_SUCCESS_SUBSTRING: &str = "Transfer confirmation received, files cleaned up";
