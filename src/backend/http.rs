//! HTTP + WebSocket client for the generation backend.
//!
//! - `submit` posts form fields to `/generate?workflow_name=...`.
//! - `fetch_result` reads `/result/{id}`; a 404 means "not ready yet".
//! - `open_channel` connects to `/ws/progress/{id}`.
//! - `workflows`, `workflow`, `checkpoints`, `gpu_status`, `upload_image`
//!   cover the auxiliary endpoints used to populate form choices.
//! - `progress` polls `/progress/{id}` for a completed flag.
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{
    CheckpointList, FrameStream, GenerationBackend, GpuStatus, ProgressReply, ResultResponse,
    SubmitResponse, UploadedImage, WorkflowList,
};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::request::GenerationRequest;
use crate::state::GeneratedImage;

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    ws_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &Config) -> AppResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(HttpBackend {
            client: builder.build().map_err(AppError::HttpClient)?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(AppError::HttpClient)?;
        if !response.status().is_success() {
            return Err(error_from_response(&format!("Failed to {}", what), response).await);
        }
        let body = response.text().await.map_err(AppError::HttpClient)?;
        Ok(serde_json::from_str(&body)?)
    }

    /// List workflow names from `/workflows`.
    pub async fn workflows(&self) -> AppResult<Vec<String>> {
        let list: WorkflowList = self.get_json("/workflows", "list workflows").await?;
        Ok(list.workflows)
    }

    /// List checkpoint names from `/checkpoints`.
    pub async fn checkpoints(&self) -> AppResult<Vec<String>> {
        let list: CheckpointList = self.get_json("/checkpoints", "list checkpoints").await?;
        Ok(list.checkpoints)
    }

    /// Raw JSON graph of one workflow from `/workflows/{name}`.
    pub async fn workflow(&self, name: &str) -> AppResult<serde_json::Value> {
        self.get_json(&format!("/workflows/{}", name), "read workflow").await
    }

    pub async fn gpu_status(&self) -> AppResult<GpuStatus> {
        self.get_json("/gpu_status", "read GPU status").await
    }

    /// Poll `/progress/{id}`. An alternative to the push channel for callers
    /// that only need to know whether a job has finished.
    pub async fn progress(&self, job_id: &str) -> AppResult<ProgressReply> {
        self.get_json(&format!("/progress/{}", job_id), "read progress").await
    }

    /// Upload a source image for img2img-style workflows.
    pub async fn upload_image(&self, path: &Path) -> AppResult<UploadedImage> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AppError::InvalidRequest(format!("Cannot read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.png".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/upload/image", self.base_url);
        tracing::info!(url = %url, file = %path.display(), "Uploading input image");
        let response = self
            .authorized(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(AppError::HttpClient)?;
        if response.status().is_success() {
            response.json().await.map_err(AppError::HttpClient)
        } else {
            Err(error_from_response("Failed to upload image", response).await)
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn submit(&self, request: &GenerationRequest) -> AppResult<String> {
        let url = format!("{}/generate", self.base_url);
        tracing::info!(url = %url, workflow = %request.workflow_id(), "Submitting generation request");
        tracing::debug!(params = ?request.params(), "Submission parameters");

        let response = self
            .authorized(self.client.post(&url))
            .query(&[("workflow_name", request.workflow_id())])
            .form(&request.form_fields())
            .send()
            .await
            .map_err(AppError::HttpClient)?;

        if !response.status().is_success() {
            let err = error_from_response("Failed to submit generation", response).await;
            tracing::error!(error = %err, "Submission rejected");
            return Err(err);
        }
        let body: SubmitResponse = response.json().await.map_err(AppError::HttpClient)?;
        let job_id = body.into_job_id()?;
        tracing::info!(job_id = %job_id, "Generation accepted");
        Ok(job_id)
    }

    async fn fetch_result(&self, job_id: &str) -> AppResult<Option<GeneratedImage>> {
        let url = format!("{}/result/{}", self.base_url, job_id);
        tracing::info!(job_id, "Fetching result over HTTP");
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(AppError::HttpClient)?;

        match response.status() {
            status if status.is_success() => {
                let body: ResultResponse = response.json().await.map_err(AppError::HttpClient)?;
                Ok(body.into_image())
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!(job_id, "Result not available yet");
                Ok(None)
            }
            _ => Err(error_from_response("Failed to fetch result", response).await),
        }
    }

    async fn open_channel(&self, job_id: &str) -> AppResult<FrameStream> {
        let url = format!("{}/ws/progress/{}", self.ws_url, job_id);
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| AppError::Channel(format!("Failed to connect to {}: {}", url, e)))?;
        tracing::info!(job_id, url = %url, "Connected to progress channel");

        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                // Some proxies relay JSON as binary frames.
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::trace!("Ignoring non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Progress channel closed by server");
                    None
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(AppError::Channel(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Build an error from a non-success response, preferring the backend's
/// `detail` field over the raw body.
async fn error_from_response(context: &str, response: Response) -> AppError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error body".to_string());
    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string));
    match detail {
        Some(detail) => AppError::Backend(detail),
        None => AppError::Backend(format!("{}. Status: {}, Body: {}", context, status, body)),
    }
}
