//! Caller-visible job state.
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{AppError, AppResult};

/// A base64-encoded image as delivered by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub base64: String,
    pub filename: Option<String>,
    pub mime_type: String,
    /// Backend's coarse classification, `"image"` or `"video"`.
    pub media_type: Option<String>,
}

impl GeneratedImage {
    pub fn new(base64: impl Into<String>) -> Self {
        GeneratedImage {
            base64: base64.into(),
            filename: None,
            mime_type: "image/png".to_string(),
            media_type: None,
        }
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        if let Some(mime) = filename.as_deref().and_then(mime_from_filename) {
            self.mime_type = mime.to_string();
        }
        self.filename = filename;
        self
    }

    pub fn with_mime_type(mut self, mime: Option<String>) -> Self {
        if let Some(m) = mime.filter(|m| !m.is_empty()) {
            self.mime_type = m;
        }
        self
    }

    pub fn with_media_type(mut self, media_type: Option<String>) -> Self {
        self.media_type = media_type.filter(|m| !m.is_empty());
        self
    }

    pub fn is_video(&self) -> bool {
        self.media_type.as_deref() == Some("video") || self.mime_type.starts_with("video/")
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }

    pub fn decode(&self) -> AppResult<Vec<u8>> {
        STANDARD
            .decode(self.base64.trim())
            .map_err(|e| AppError::Backend(format!("Invalid base64 image payload: {}", e)))
    }
}

fn mime_from_filename(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "mp4" => Some("video/mp4"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Submitting,
    Running {
        job_id: String,
        percent: u8,
        preview: Option<GeneratedImage>,
    },
    Done {
        job_id: String,
        image: GeneratedImage,
        elapsed: Duration,
    },
    Failed {
        job_id: Option<String>,
        message: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done { .. } | JobState::Failed { .. })
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobState::Running { job_id, .. } | JobState::Done { job_id, .. } => Some(job_id),
            JobState::Failed { job_id, .. } => job_id.as_deref(),
            JobState::Idle | JobState::Submitting => None,
        }
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            JobState::Running { percent, .. } => Some(*percent),
            JobState::Done { .. } => Some(100),
            _ => None,
        }
    }
}

/// What a UI renders: the state, whether resubmission should be disabled,
/// and the latest non-fatal message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobSnapshot {
    pub state: JobState,
    pub generating: bool,
    pub notice: Option<String>,
}
