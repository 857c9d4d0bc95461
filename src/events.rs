//! Progress-channel frames and their normalization into [`JobEvent`].
//!
//! The backend sends JSON text frames shaped `{"type": "<kind>", ...}` with
//! type-specific fields at the top level. Several backends name the terminal
//! signal differently; all of those collapse into [`JobEvent::Completed`].
use serde::Deserialize;

/// Frame types that mean "the job will produce nothing further".
pub const COMPLETION_SYNONYMS: &[&str] = &[
    "done",
    "executed",
    "final_result",
    "completed",
    "complete",
    "finished",
    "execution_success",
    "success",
];

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress { current: f64, max: f64 },
    /// Intermediate rendering; does not change job state.
    Preview { image_base64: String },
    /// Final artifact. `image_base64` is absent for outputs the backend only
    /// names by filename (e.g. animated outputs).
    Output {
        image_base64: Option<String>,
        filename: Option<String>,
        mime_type: Option<String>,
        media_type: Option<String>,
    },
    Completed,
    Error { message: String },
    /// Informational backend message.
    Status { message: Option<String> },
}

impl JobEvent {
    /// `floor(current / max * 100)` clamped to `0..=100`; `None` when `max`
    /// is not positive or this is not a progress event.
    pub fn percent(&self) -> Option<u8> {
        match *self {
            JobEvent::Progress { current, max } if max > 0.0 && current.is_finite() => {
                let pct = (current / max * 100.0).floor();
                Some(pct.clamp(0.0, 100.0) as u8)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    value: Option<f64>,
    #[serde(alias = "max")]
    max_value: Option<f64>,
    image_base64: Option<String>,
    filename: Option<String>,
    mime_type: Option<String>,
    media_type: Option<String>,
    message: Option<String>,
    detail: Option<String>,
}

/// Parse one text frame. Returns `None` for malformed JSON, unknown types,
/// or frames missing their required fields; callers ignore those.
pub fn parse_frame(text: &str) -> Option<JobEvent> {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring malformed progress frame");
            return None;
        }
    };

    let kind = raw.kind.to_ascii_lowercase();
    let event = match kind.as_str() {
        "progress" => JobEvent::Progress {
            current: raw.value?,
            max: raw.max_value?,
        },
        "preview" => JobEvent::Preview { image_base64: raw.image_base64.filter(|s| !s.is_empty())? },
        "output" => JobEvent::Output {
            image_base64: raw.image_base64.filter(|s| !s.is_empty()),
            filename: raw.filename,
            mime_type: raw.mime_type,
            media_type: raw.media_type,
        },
        "error" | "execution_error" => JobEvent::Error {
            message: raw
                .message
                .or(raw.detail)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "generation failed".to_string()),
        },
        "status" => JobEvent::Status { message: raw.message.or(raw.detail) },
        k if COMPLETION_SYNONYMS.contains(&k) => JobEvent::Completed,
        other => {
            tracing::debug!(kind = %other, "Ignoring unknown progress frame type");
            return None;
        }
    };
    Some(event)
}
