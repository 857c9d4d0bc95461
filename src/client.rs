//! Job lifecycle client.
//!
//! [`JobClient`] drives one generation job at a time: submit, follow the
//! progress channel, recover through the result endpoint when the channel
//! closes early, and settle on exactly one terminal outcome. Callers watch
//! [`JobSnapshot`]s through [`JobClient::subscribe`].
//!
//! Each tracked job runs in its own task holding the job id and a
//! cancellation token. Starting a new job cancels the old task and resets
//! the tracker slot, so the old task's late frames are rejected.
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::GenerationBackend;
use crate::config::Config;
use crate::error::AppResult;
use crate::events::parse_frame;
use crate::request::GenerationRequest;
use crate::retry::RetryPolicy;
use crate::state::{JobSnapshot, JobState};
use crate::tracker::{Flow, JobTracker};

/// Identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    job_id: String,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

struct TrackedJob {
    job_id: String,
    cancel: CancellationToken,
}

pub struct JobClient<B: GenerationBackend> {
    backend: Arc<B>,
    tracker: Arc<Mutex<JobTracker>>,
    fallback: RetryPolicy,
    current: Mutex<Option<TrackedJob>>,
}

impl<B: GenerationBackend> JobClient<B> {
    pub fn new(backend: B, config: &Config) -> Self {
        Self::with_options(backend, config.grace_window, config.fallback.clone())
    }

    pub fn with_options(backend: B, grace_window: Duration, fallback: RetryPolicy) -> Self {
        JobClient {
            backend: Arc::new(backend),
            tracker: Arc::new(Mutex::new(JobTracker::new(grace_window))),
            fallback,
            current: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.tracker.lock().await.subscribe()
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        self.tracker.lock().await.snapshot().clone()
    }

    /// Whether resubmission should currently be disabled.
    pub async fn is_generating(&self) -> bool {
        self.tracker.lock().await.snapshot().generating
    }

    /// Submit `request` and start following its progress.
    ///
    /// Any job still being tracked is abandoned first. On failure the state
    /// is `Failed` with the backend's message and the error is returned.
    pub async fn submit(&self, request: &GenerationRequest) -> AppResult<JobHandle> {
        request.validate()?;
        self.tracker.lock().await.begin_submit(Instant::now())?;
        self.cancel_current().await;

        let job_id = match self.backend.submit(request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(workflow = %request.workflow_id(), error = %e, "Submission failed");
                self.tracker.lock().await.submit_failed(e.to_string());
                return Err(e);
            }
        };

        // Held until the job is installed in `current`.
        let mut tracker = self.tracker.lock().await;
        if !tracker.start(&job_id, Instant::now()) {
            tracing::info!(job_id = %job_id, "Client was reset during submission, not tracking");
            return Ok(JobHandle { job_id });
        }

        let cancel = CancellationToken::new();
        tokio::spawn(track_job(
            Arc::clone(&self.backend),
            Arc::clone(&self.tracker),
            job_id.clone(),
            self.fallback.clone(),
            cancel.clone(),
        ));
        let tracked = TrackedJob { job_id: job_id.clone(), cancel };
        if let Some(displaced) = self.current.lock().await.replace(tracked) {
            tracing::debug!(job_id = %displaced.job_id, "Cancelling displaced job");
            displaced.cancel.cancel();
        }
        drop(tracker);
        Ok(JobHandle { job_id })
    }

    /// Wait until the current job is `Done` or `Failed` (or the client is
    /// reset to `Idle`) and return that state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.subscribe().await;
        let result = rx
            .wait_for(|s| s.state.is_terminal() || s.state == JobState::Idle)
            .await
            .map(|s| s.state.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.snapshot().await.state,
        }
    }

    /// Stop tracking the current job and return to `Idle`.
    pub async fn dispose(&self) {
        self.cancel_current().await;
        self.tracker.lock().await.reset();
    }

    async fn cancel_current(&self) {
        if let Some(prev) = self.current.lock().await.take() {
            tracing::debug!(job_id = %prev.job_id, "Cancelling tracked job");
            prev.cancel.cancel();
        }
    }
}

impl<B: GenerationBackend> Drop for JobClient<B> {
    fn drop(&mut self) {
        if let Some(prev) = self.current.get_mut().take() {
            prev.cancel.cancel();
        }
    }
}

async fn track_job<B: GenerationBackend>(
    backend: Arc<B>,
    tracker: Arc<Mutex<JobTracker>>,
    job_id: String,
    fallback: RetryPolicy,
    cancel: CancellationToken,
) {
    if follow_channel(backend.as_ref(), &tracker, &job_id, &cancel).await == Flow::Stale {
        tracing::debug!(job_id = %job_id, "Tracking stopped for superseded job");
        return;
    }
    recover_result(backend.as_ref(), &tracker, &job_id, &fallback, &cancel).await;
}

/// Read the progress channel until it closes or the tracker asks to close
/// it. The stream is dropped (closing the channel) before returning.
async fn follow_channel<B: GenerationBackend>(
    backend: &B,
    tracker: &Mutex<JobTracker>,
    job_id: &str,
    cancel: &CancellationToken,
) -> Flow {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return Flow::Stale,
        result = backend.open_channel(job_id) => result,
    };
    let mut frames = match opened {
        Ok(frames) => {
            tracker.lock().await.channel_opened(job_id);
            frames
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Could not open progress channel");
            tracker.lock().await.channel_error(job_id, &e.to_string());
            return Flow::Close;
        }
    };

    loop {
        let deadline = tracker.lock().await.grace_deadline(job_id);
        let flow = tokio::select! {
            _ = cancel.cancelled() => Flow::Stale,
            _ = grace_timer(deadline) => {
                tracker.lock().await.grace_expired(job_id, Instant::now())
            }
            frame = frames.next() => match frame {
                Some(Ok(text)) => match parse_frame(&text) {
                    Some(event) => tracker.lock().await.apply(job_id, event, Instant::now()),
                    None => Flow::Continue,
                },
                Some(Err(e)) => {
                    tracing::warn!(job_id, error = %e, "Progress channel transport error");
                    tracker.lock().await.channel_error(job_id, &e.to_string());
                    Flow::Close
                }
                None => {
                    tracing::debug!(job_id, "Progress channel closed");
                    Flow::Close
                }
            },
        };
        if flow != Flow::Continue {
            return flow;
        }
    }
}

async fn grace_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Fallback fetch: runs only while nothing terminal has been rendered,
/// retrying misses per `policy` before giving up.
async fn recover_result<B: GenerationBackend>(
    backend: &B,
    tracker: &Mutex<JobTracker>,
    job_id: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) {
    let mut delay = policy.initial_delay;
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        if !tracker.lock().await.needs_fallback(job_id) {
            return;
        }
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            result = backend.fetch_result(job_id) => result,
        };
        match fetched {
            Ok(Some(image)) => {
                tracker.lock().await.fallback_resolved(job_id, image, Instant::now());
                return;
            }
            Ok(None) => {
                tracing::info!(job_id, attempt, "Fallback fetch found no result");
                tracker.lock().await.fallback_missed(job_id);
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Fallback fetch failed");
                tracker.lock().await.fallback_failed(job_id, e.to_string());
                return;
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = policy.next_delay(delay);
        }
    }

    tracker
        .lock()
        .await
        .fallback_failed(job_id, format!("No result found for job {}", job_id));
}
