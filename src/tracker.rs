//! State machine for the single current-job slot.
//!
//! [`JobTracker`] owns everything a UI observes about the job in flight and
//! is the only place that mutates it. Every entry point that reacts to the
//! network takes the job id the caller believes it is serving and returns
//! without effect when that job is no longer current, so a superseded
//! job's channel or timer can never touch the new job's state.
//!
//! The tracker does no I/O and never reads the clock; callers pass `now`.
//! Changes are published on a [`watch`] channel.
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::events::JobEvent;
use crate::state::{GeneratedImage, JobSnapshot, JobState};

/// What the channel driver should do after handing the tracker an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading the channel.
    Continue,
    /// Close the channel; the fallback fetch runs if no result was rendered.
    Close,
    /// The job is no longer current; stop without touching anything.
    Stale,
}

#[derive(Debug)]
struct ActiveJob {
    job_id: String,
    started_at: Instant,
    percent: u8,
    preview: Option<GeneratedImage>,
    grace_deadline: Option<Instant>,
}

pub struct JobTracker {
    snapshot: JobSnapshot,
    active: Option<ActiveJob>,
    submit_started: Option<Instant>,
    grace_window: Duration,
    notify: watch::Sender<JobSnapshot>,
}

impl JobTracker {
    pub fn new(grace_window: Duration) -> Self {
        let (notify, _) = watch::channel(JobSnapshot::default());
        JobTracker {
            snapshot: JobSnapshot::default(),
            active: None,
            submit_started: None,
            grace_window,
            notify,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.notify.subscribe()
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    pub fn state(&self) -> &JobState {
        &self.snapshot.state
    }

    pub fn current_job(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.job_id.as_str())
    }

    pub fn is_current(&self, job_id: &str) -> bool {
        self.current_job() == Some(job_id)
    }

    /// Pending grace deadline for `job_id`, if armed.
    pub fn grace_deadline(&self, job_id: &str) -> Option<Instant> {
        self.active
            .as_ref()
            .filter(|a| a.job_id == job_id)
            .and_then(|a| a.grace_deadline)
    }

    /// Enter `Submitting`, dropping whatever job occupied the slot.
    pub fn begin_submit(&mut self, now: Instant) -> AppResult<()> {
        if self.snapshot.state == JobState::Submitting {
            return Err(AppError::Busy);
        }
        if let Some(prev) = self.active.take() {
            tracing::debug!(job_id = %prev.job_id, "Dropping previous job from slot");
        }
        self.submit_started = Some(now);
        self.snapshot = JobSnapshot { state: JobState::Submitting, generating: true, notice: None };
        self.publish();
        Ok(())
    }

    pub fn submit_failed(&mut self, message: impl Into<String>) {
        if self.snapshot.state != JobState::Submitting {
            return;
        }
        self.submit_started = None;
        self.snapshot = JobSnapshot {
            state: JobState::Failed { job_id: None, message: message.into() },
            generating: false,
            notice: None,
        };
        self.publish();
    }

    /// Acknowledged submission: `Running` at 0 %. Returns false when the
    /// slot was reset while the submission was in flight.
    pub fn start(&mut self, job_id: &str, now: Instant) -> bool {
        if self.snapshot.state != JobState::Submitting {
            return false;
        }
        let started_at = self.submit_started.take().unwrap_or(now);
        self.active = Some(ActiveJob {
            job_id: job_id.to_string(),
            started_at,
            percent: 0,
            preview: None,
            grace_deadline: None,
        });
        self.snapshot = JobSnapshot {
            state: JobState::Running { job_id: job_id.to_string(), percent: 0, preview: None },
            generating: true,
            notice: None,
        };
        self.publish();
        true
    }

    /// Channel handshake completed.
    pub fn channel_opened(&mut self, job_id: &str) {
        if !self.is_current(job_id) || self.snapshot.state.is_terminal() {
            return;
        }
        tracing::debug!(job_id, "Progress channel open");
        if !self.snapshot.generating {
            self.snapshot.generating = true;
            self.publish();
        }
    }

    pub fn apply(&mut self, job_id: &str, event: JobEvent, now: Instant) -> Flow {
        if !self.is_current(job_id) {
            tracing::debug!(job_id, "Ignoring event for superseded job");
            return Flow::Stale;
        }
        if self.snapshot.state.is_terminal() {
            return Flow::Close;
        }
        let grace_window = self.grace_window;
        let Some(active) = self.active.as_mut() else {
            return Flow::Stale;
        };

        match event {
            JobEvent::Progress { .. } => {
                let Some(pct) = event.percent() else {
                    return Flow::Continue;
                };
                active.grace_deadline = None;
                active.percent = active.percent.max(pct);
                if active.percent >= 99 {
                    active.grace_deadline = Some(now + grace_window);
                }
                self.refresh_running();
                Flow::Continue
            }
            JobEvent::Preview { image_base64 } => {
                active.grace_deadline = None;
                active.preview = Some(GeneratedImage::new(image_base64));
                self.refresh_running();
                Flow::Continue
            }
            JobEvent::Output { image_base64, filename, mime_type, media_type } => {
                active.grace_deadline = None;
                let image = match image_base64 {
                    Some(data) => Some(
                        GeneratedImage::new(data)
                            .with_filename(filename)
                            .with_mime_type(mime_type)
                            .with_media_type(media_type),
                    ),
                    None => active.preview.clone(),
                };
                self.finish_with(image, now)
            }
            JobEvent::Completed => {
                active.grace_deadline = None;
                let image = active.preview.clone();
                self.finish_with(image, now)
            }
            JobEvent::Error { message } => {
                active.grace_deadline = None;
                tracing::warn!(job_id, error = %message, "Backend reported generation error");
                self.fail(message);
                Flow::Close
            }
            JobEvent::Status { message } => {
                if let Some(msg) = message {
                    tracing::info!(job_id, status = %msg, "Backend status");
                    self.snapshot.notice = Some(msg);
                    self.publish();
                }
                Flow::Continue
            }
        }
    }

    /// Grace timer fired. Finalizes with the held preview only if the
    /// deadline still stands; a cleared or re-armed timer is a no-op.
    pub fn grace_expired(&mut self, job_id: &str, now: Instant) -> Flow {
        if !self.is_current(job_id) {
            return Flow::Stale;
        }
        if self.snapshot.state.is_terminal() {
            return Flow::Close;
        }
        let Some(active) = self.active.as_mut() else {
            return Flow::Stale;
        };
        match active.grace_deadline {
            Some(deadline) if now >= deadline => {
                active.grace_deadline = None;
                tracing::info!(job_id, "No completion after grace window, finalizing locally");
                let image = active.preview.clone();
                self.finish_with(image, now)
            }
            _ => Flow::Continue,
        }
    }

    /// Transport failure on the channel. Not fatal: the close path still
    /// runs the fallback fetch.
    pub fn channel_error(&mut self, job_id: &str, message: &str) {
        if !self.is_current(job_id) || self.snapshot.state.is_terminal() {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.grace_deadline = None;
        }
        self.snapshot.generating = false;
        self.snapshot.notice = Some(format!("Connection error: {}", message));
        self.publish();
    }

    /// True when `job_id` is current and nothing terminal has been rendered.
    pub fn needs_fallback(&self, job_id: &str) -> bool {
        self.is_current(job_id) && !self.snapshot.state.is_terminal()
    }

    pub fn fallback_resolved(&mut self, job_id: &str, image: GeneratedImage, now: Instant) -> bool {
        if !self.needs_fallback(job_id) {
            return false;
        }
        self.finish_with(Some(image), now) == Flow::Close && self.snapshot.state.is_terminal()
    }

    pub fn fallback_missed(&mut self, job_id: &str) {
        if !self.needs_fallback(job_id) {
            return;
        }
        self.snapshot.notice = Some(format!("No result found for job {} yet", job_id));
        self.publish();
    }

    pub fn fallback_failed(&mut self, job_id: &str, message: impl Into<String>) {
        if !self.needs_fallback(job_id) {
            return;
        }
        self.fail(message.into());
    }

    /// Back to `Idle`, forgetting the current job.
    pub fn reset(&mut self) {
        self.active = None;
        self.submit_started = None;
        self.snapshot = JobSnapshot::default();
        self.publish();
    }

    fn finish_with(&mut self, image: Option<GeneratedImage>, now: Instant) -> Flow {
        let Some(active) = self.active.as_ref() else {
            return Flow::Stale;
        };
        if let Some(image) = image {
            let elapsed = now.saturating_duration_since(active.started_at);
            tracing::info!(
                job_id = %active.job_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Generation done"
            );
            self.snapshot = JobSnapshot {
                state: JobState::Done { job_id: active.job_id.clone(), image, elapsed },
                generating: false,
                notice: None,
            };
            self.publish();
        }
        Flow::Close
    }

    fn fail(&mut self, message: String) {
        let job_id = self.current_job().map(str::to_string);
        self.snapshot = JobSnapshot {
            state: JobState::Failed { job_id, message },
            generating: false,
            notice: None,
        };
        self.publish();
    }

    fn refresh_running(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let next = JobState::Running {
            job_id: active.job_id.clone(),
            percent: active.percent,
            preview: active.preview.clone(),
        };
        if self.snapshot.state != next {
            self.snapshot.state = next;
            self.publish();
        }
    }

    fn publish(&self) {
        self.notify.send_replace(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(12);

    fn running(job_id: &str) -> (JobTracker, Instant) {
        let now = Instant::now();
        let mut t = JobTracker::new(GRACE);
        t.begin_submit(now).unwrap();
        t.start(job_id, now);
        (t, now)
    }

    fn progress(current: f64, max: f64) -> JobEvent {
        JobEvent::Progress { current, max }
    }

    fn output(data: &str) -> JobEvent {
        JobEvent::Output {
            image_base64: Some(data.to_string()),
            filename: Some("out.png".to_string()),
            mime_type: None,
            media_type: None,
        }
    }

    #[test]
    fn submit_then_start_runs_at_zero() {
        let (t, _) = running("abc");
        assert_eq!(
            t.state(),
            &JobState::Running { job_id: "abc".into(), percent: 0, preview: None }
        );
        assert!(t.snapshot().generating);
    }

    #[test]
    fn start_after_reset_is_refused() {
        let mut t = JobTracker::new(GRACE);
        t.begin_submit(Instant::now()).unwrap();
        t.reset();
        assert!(!t.start("abc", Instant::now()));
        assert_eq!(t.state(), &JobState::Idle);
    }

    #[test]
    fn second_submit_while_submitting_is_busy() {
        let mut t = JobTracker::new(GRACE);
        t.begin_submit(Instant::now()).unwrap();
        assert!(matches!(t.begin_submit(Instant::now()), Err(AppError::Busy)));
    }

    #[test]
    fn submit_failure_clears_generating() {
        let mut t = JobTracker::new(GRACE);
        t.begin_submit(Instant::now()).unwrap();
        t.submit_failed("No GPU available");
        assert_eq!(
            t.state(),
            &JobState::Failed { job_id: None, message: "No GPU available".into() }
        );
        assert!(!t.snapshot().generating);
    }

    #[test]
    fn percentage_never_regresses() {
        let (mut t, now) = running("abc");
        t.apply("abc", progress(5.0, 10.0), now);
        assert_eq!(t.state().percent(), Some(50));
        t.apply("abc", progress(2.0, 10.0), now);
        assert_eq!(t.state().percent(), Some(50));
        t.apply("abc", progress(7.0, 10.0), now);
        assert_eq!(t.state().percent(), Some(70));
    }

    #[test]
    fn output_finalizes_once() {
        let (mut t, now) = running("abc");
        let mut rx = t.subscribe();
        t.apply("abc", progress(5.0, 10.0), now);
        let later = now + Duration::from_secs(3);
        assert_eq!(t.apply("abc", output("iVBOR"), later), Flow::Close);
        match t.state() {
            JobState::Done { image, elapsed, .. } => {
                assert_eq!(image.base64, "iVBOR");
                assert_eq!(image.filename.as_deref(), Some("out.png"));
                assert_eq!(*elapsed, Duration::from_secs(3));
            }
            other => panic!("Expected Done, got {other:?}"),
        }
        rx.borrow_and_update();

        assert_eq!(t.apply("abc", JobEvent::Completed, later), Flow::Close);
        assert_eq!(t.apply("abc", output("other"), later), Flow::Close);
        assert!(!rx.has_changed().unwrap());
        assert!(!t.needs_fallback("abc"));
    }

    #[test]
    fn completed_without_preview_defers_to_fallback() {
        let (mut t, now) = running("abc");
        assert_eq!(t.apply("abc", JobEvent::Completed, now), Flow::Close);
        assert!(t.needs_fallback("abc"));
    }

    #[test]
    fn output_without_payload_defers_to_fallback() {
        let (mut t, now) = running("abc");
        let event = JobEvent::Output {
            image_base64: None,
            filename: Some("clip.gif".into()),
            mime_type: None,
            media_type: Some("video".into()),
        };
        assert_eq!(t.apply("abc", event, now), Flow::Close);
        assert!(!t.state().is_terminal());
        assert!(t.needs_fallback("abc"));
    }

    #[test]
    fn output_keeps_media_type() {
        let (mut t, now) = running("abc");
        let event = JobEvent::Output {
            image_base64: Some("R0lG".into()),
            filename: Some("clip.gif".into()),
            mime_type: None,
            media_type: Some("video".into()),
        };
        t.apply("abc", event, now);
        match t.state() {
            JobState::Done { image, .. } => {
                assert_eq!(image.media_type.as_deref(), Some("video"));
                assert_eq!(image.mime_type, "image/gif");
            }
            other => panic!("Expected Done, got {other:?}"),
        }
    }

    #[test]
    fn completed_uses_latest_preview() {
        let (mut t, now) = running("abc");
        t.apply("abc", JobEvent::Preview { image_base64: "p1".into() }, now);
        t.apply("abc", JobEvent::Preview { image_base64: "p2".into() }, now);
        t.apply("abc", JobEvent::Completed, now);
        match t.state() {
            JobState::Done { image, .. } => assert_eq!(image.base64, "p2"),
            other => panic!("Expected Done, got {other:?}"),
        }
    }

    #[test]
    fn grace_window_arms_at_99_and_finalizes_with_preview() {
        let (mut t, now) = running("abc");
        t.apply("abc", JobEvent::Preview { image_base64: "prev".into() }, now);
        t.apply("abc", progress(99.0, 100.0), now);
        let deadline = t.grace_deadline("abc").unwrap();
        assert_eq!(deadline, now + GRACE);

        assert_eq!(t.grace_expired("abc", now + Duration::from_secs(5)), Flow::Continue);
        assert_eq!(t.grace_expired("abc", deadline), Flow::Close);
        assert!(matches!(t.state(), JobState::Done { image, .. } if image.base64 == "prev"));
        assert_eq!(t.grace_expired("abc", deadline), Flow::Close);
    }

    #[test]
    fn preview_after_arming_clears_timer() {
        let (mut t, now) = running("abc");
        t.apply("abc", progress(99.0, 100.0), now);
        assert!(t.grace_deadline("abc").is_some());
        t.apply("abc", JobEvent::Preview { image_base64: "p".into() }, now + Duration::from_secs(1));
        assert!(t.grace_deadline("abc").is_none());
        assert_eq!(t.grace_expired("abc", now + GRACE), Flow::Continue);
        assert!(!t.state().is_terminal());
    }

    #[test]
    fn progress_after_arming_moves_deadline() {
        let (mut t, now) = running("abc");
        t.apply("abc", progress(99.0, 100.0), now);
        let later = now + Duration::from_secs(10);
        t.apply("abc", progress(100.0, 100.0), later);
        assert_eq!(t.grace_deadline("abc"), Some(later + GRACE));
        assert_eq!(t.grace_expired("abc", now + GRACE), Flow::Continue);
    }

    #[test]
    fn grace_without_preview_closes_for_fallback() {
        let (mut t, now) = running("abc");
        t.apply("abc", progress(99.0, 100.0), now);
        assert_eq!(t.grace_expired("abc", now + GRACE), Flow::Close);
        assert!(t.needs_fallback("abc"));
    }

    #[test]
    fn error_event_fails_job() {
        let (mut t, now) = running("abc");
        assert_eq!(t.apply("abc", JobEvent::Error { message: "oom".into() }, now), Flow::Close);
        assert_eq!(
            t.state(),
            &JobState::Failed { job_id: Some("abc".into()), message: "oom".into() }
        );
        assert!(!t.needs_fallback("abc"));
    }

    #[test]
    fn stale_job_cannot_mutate_new_job() {
        let (mut t, now) = running("job-a");
        t.begin_submit(now).unwrap();
        t.start("job-b", now);
        let before = t.snapshot().clone();

        assert_eq!(t.apply("job-a", progress(9.0, 10.0), now), Flow::Stale);
        assert_eq!(t.apply("job-a", output("late"), now), Flow::Stale);
        assert_eq!(t.grace_expired("job-a", now + GRACE), Flow::Stale);
        t.channel_error("job-a", "reset");
        assert!(!t.fallback_resolved("job-a", GeneratedImage::new("x"), now));
        t.fallback_failed("job-a", "gone");

        assert_eq!(t.snapshot(), &before);
    }

    #[test]
    fn channel_error_is_not_fatal() {
        let (mut t, now) = running("abc");
        t.apply("abc", progress(99.0, 100.0), now);
        t.channel_error("abc", "connection reset");
        let snap = t.snapshot();
        assert!(!snap.generating);
        assert_eq!(snap.notice.as_deref(), Some("Connection error: connection reset"));
        assert!(t.grace_deadline("abc").is_none());
        assert!(t.needs_fallback("abc"));
    }

    #[test]
    fn fallback_resolves_exactly_once() {
        let (mut t, now) = running("abc");
        assert!(t.fallback_resolved("abc", GeneratedImage::new("data"), now));
        assert!(!t.fallback_resolved("abc", GeneratedImage::new("again"), now));
        assert!(matches!(t.state(), JobState::Done { image, .. } if image.base64 == "data"));
    }

    #[test]
    fn fallback_miss_keeps_running() {
        let (mut t, _) = running("abc");
        t.fallback_missed("abc");
        assert!(matches!(t.state(), JobState::Running { .. }));
        assert_eq!(t.snapshot().notice.as_deref(), Some("No result found for job abc yet"));
    }

    #[test]
    fn status_sets_notice_only() {
        let (mut t, now) = running("abc");
        let flow = t.apply("abc", JobEvent::Status { message: Some("queued".into()) }, now);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(t.snapshot().notice.as_deref(), Some("queued"));
        assert!(matches!(t.state(), JobState::Running { percent: 0, .. }));
    }

    #[test]
    fn reset_returns_to_idle() {
        let (mut t, _) = running("abc");
        t.reset();
        assert_eq!(t.snapshot(), &JobSnapshot::default());
        assert!(t.current_job().is_none());
    }
}
