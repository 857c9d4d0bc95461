//! Contract with the generation backend.
//!
//! [`GenerationBackend`] is the seam between the job client and the network:
//! [`http::HttpBackend`] talks to a real server, tests script their own.
pub mod http;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::request::GenerationRequest;
use crate::state::GeneratedImage;

pub use http::HttpBackend;

/// Text frames from a job's progress channel. The stream ends when the
/// channel closes; an `Err` item is a transport failure. Dropping the
/// stream closes the channel.
pub type FrameStream = BoxStream<'static, AppResult<String>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Submit a request; returns the backend job id.
    async fn submit(&self, request: &GenerationRequest) -> AppResult<String>;

    /// One-shot result retrieval. `Ok(None)` means no image is available yet.
    async fn fetch_result(&self, job_id: &str) -> AppResult<Option<GeneratedImage>>;

    /// Open the push channel for `job_id`.
    async fn open_channel(&self, job_id: &str) -> AppResult<FrameStream>;
}

/// Reply from `POST /generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub status: Option<String>,
    pub prompt_id: Option<String>,
    pub client_id: Option<String>,
    pub detail: Option<String>,
}

impl SubmitResponse {
    /// Job id, or the backend's reason for not starting one.
    pub fn into_job_id(self) -> AppResult<String> {
        let status = self.status.as_deref().unwrap_or("processing_started");
        if status.eq_ignore_ascii_case("error") {
            return Err(AppError::Backend(
                self.detail.unwrap_or_else(|| "Generation request rejected".to_string()),
            ));
        }
        self.prompt_id
            .or(self.client_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                AppError::Backend(
                    self.detail.unwrap_or_else(|| "Backend response lacked a job id".to_string()),
                )
            })
    }
}

/// Reply from `GET /result/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultResponse {
    pub image_base64: Option<String>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub media_type: Option<String>,
}

impl ResultResponse {
    pub fn into_image(self) -> Option<GeneratedImage> {
        let data = self.image_base64.filter(|d| !d.is_empty())?;
        Some(
            GeneratedImage::new(data)
                .with_filename(self.filename)
                .with_mime_type(self.mime_type)
                .with_media_type(self.media_type),
        )
    }
}

/// Reply from `GET /progress/{id}`, the polling view of a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressReply {
    #[serde(default)]
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressStatus {
    #[serde(default)]
    pub completed: bool,
    pub status_str: Option<String>,
}

impl ProgressReply {
    pub fn completed(&self) -> bool {
        self.status.completed
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowList {
    #[serde(default)]
    pub workflows: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointList {
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GpuStatus {
    pub name: Option<String>,
    pub status: Option<String>,
    pub load: Option<f64>,
    pub memory_used: Option<f64>,
    pub memory_total: Option<f64>,
    pub temperature: Option<f64>,
}

/// Reply from `POST /upload/image`. `comfy_path` is what a request's
/// `input_image` parameter should reference.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    pub comfy_path: String,
    pub local_path: Option<String>,
    pub subfolder: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> SubmitResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn processing_started_yields_prompt_id() {
        let r = parse(r#"{"status":"processing_started","prompt_id":"abc"}"#);
        assert_eq!(r.into_job_id().unwrap(), "abc");
    }

    #[test]
    fn client_id_is_accepted() {
        let r = parse(r#"{"status":"processing_started","client_id":"c-1"}"#);
        assert_eq!(r.into_job_id().unwrap(), "c-1");
    }

    #[test]
    fn error_status_surfaces_detail() {
        let r = parse(r#"{"status":"error","detail":"No GPU available"}"#);
        let err = r.into_job_id().unwrap_err();
        assert_eq!(err.to_string(), "No GPU available");
    }

    #[test]
    fn missing_id_is_an_error() {
        let r = parse(r#"{"status":"processing_started","prompt_id":null}"#);
        assert!(matches!(r.into_job_id(), Err(AppError::Backend(_))));
    }

    #[test]
    fn result_without_image_is_a_miss() {
        let r: ResultResponse = serde_json::from_str(r#"{"filename":"x.png"}"#).unwrap();
        assert!(r.into_image().is_none());
        let r: ResultResponse =
            serde_json::from_str(r#"{"image_base64":"AAAA","filename":"x.png"}"#).unwrap();
        let img = r.into_image().unwrap();
        assert_eq!(img.filename.as_deref(), Some("x.png"));
    }

    #[test]
    fn result_carries_media_type() {
        let r: ResultResponse = serde_json::from_str(
            r#"{"image_base64":"R0lG","filename":"clip.gif","media_type":"video"}"#,
        )
        .unwrap();
        assert!(r.into_image().unwrap().is_video());
    }

    #[test]
    fn progress_reply_reads_nested_completed() {
        let r: ProgressReply =
            serde_json::from_str(r#"{"status":{"completed":true,"status_str":"success"}}"#).unwrap();
        assert!(r.completed());
        assert_eq!(r.status.status_str.as_deref(), Some("success"));

        let r: ProgressReply = serde_json::from_str("{}").unwrap();
        assert!(!r.completed());
    }
}
