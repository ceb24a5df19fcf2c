use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use scenecast_contracts::events::EventWriter;
use scenecast_contracts::jobs::{GenerationJob, GenerationOutcome, JobNotice, JobStatus};
use serde_json::json;

use crate::config::{ImageJobSettings, PollSettings};
use crate::{map_object, truncate_text, FetchResponse, ImageJobRequest, ImageJobService};

const MALFORMED_SUCCESS: &str = "malformed success payload: no result url";

/// The backend refused the job or could not be reached to submit it. No
/// polling happened and nothing was retried.
#[derive(Debug)]
pub struct SubmissionError {
    status_code: Option<u16>,
    cause: anyhow::Error,
}

impl SubmissionError {
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image job submission failed: {:#}", self.cause)
    }
}

impl std::error::Error for SubmissionError {}

/// Shared cancel flag for one request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait PollClock: Send + Sync {
    /// Waits `duration` unless `cancel` fires first. Returns `false` when the
    /// wait was cut short by cancellation.
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Blocks the calling thread, waking every `slice` to check for cancellation.
#[derive(Debug, Clone, Copy)]
pub struct ThreadClock {
    slice: Duration,
}

impl Default for ThreadClock {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(100),
        }
    }
}

impl PollClock for ThreadClock {
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.slice));
        }
    }
}

/// Best-effort delivery of [`JobNotice`]s.
///
/// `offer` must not block. A notice may be dropped (full or closed channel);
/// the return value only says whether it was handed off.
pub trait NoticeSink: Send + Sync {
    fn offer(&self, notice: JobNotice) -> bool;
}

impl NoticeSink for mpsc::SyncSender<JobNotice> {
    fn offer(&self, notice: JobNotice) -> bool {
        self.try_send(notice).is_ok()
    }
}

impl NoticeSink for mpsc::Sender<JobNotice> {
    fn offer(&self, notice: JobNotice) -> bool {
        self.send(notice).is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardNotices;

impl NoticeSink for DiscardNotices {
    fn offer(&self, _notice: JobNotice) -> bool {
        false
    }
}

/// Submits one image job and follows it to a terminal outcome.
pub struct GenerationJobPoller<S, C = ThreadClock> {
    service: S,
    clock: C,
    image: ImageJobSettings,
    poll: PollSettings,
    events: EventWriter,
}

impl<S: ImageJobService> GenerationJobPoller<S, ThreadClock> {
    pub fn new(
        service: S,
        image: ImageJobSettings,
        poll: PollSettings,
        events: EventWriter,
    ) -> Self {
        Self::with_clock(service, ThreadClock::default(), image, poll, events)
    }
}

impl<S: ImageJobService, C: PollClock> GenerationJobPoller<S, C> {
    pub fn with_clock(
        service: S,
        clock: C,
        image: ImageJobSettings,
        poll: PollSettings,
        events: EventWriter,
    ) -> Self {
        Self {
            service,
            clock,
            image,
            poll,
            events,
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    pub fn run(
        &self,
        prompt: &str,
        notices: &dyn NoticeSink,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome, SubmissionError> {
        let mut job = self.submit(prompt)?;
        Ok(self.follow(&mut job, notices, cancel))
    }

    fn submit(&self, prompt: &str) -> Result<GenerationJob, SubmissionError> {
        let request = ImageJobRequest {
            model: self.image.model.clone(),
            prompt: prompt.to_string(),
            size: self.image.size.clone(),
            count: self.image.count,
        };
        let response = match self.service.submit(&request) {
            Ok(response) => response,
            Err(err) => return Err(self.submission_failed(None, err)),
        };
        if !response.is_ok() {
            let cause = anyhow!(
                "backend returned {}: {} - {}",
                response.status_code,
                response.code.as_deref().unwrap_or("unknown"),
                response.message.as_deref().unwrap_or("no message")
            );
            return Err(self.submission_failed(Some(response.status_code), cause));
        }
        let Some(task_id) = response
            .task_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        else {
            let cause = anyhow!("backend accepted the job without a task id");
            return Err(self.submission_failed(Some(response.status_code), cause));
        };

        self.events.record(
            "job_submitted",
            map_object(json!({
                "task_id": task_id,
                "model": request.model,
                "size": request.size,
                "prompt": truncate_text(prompt, 200),
            })),
        );
        Ok(GenerationJob::new(task_id))
    }

    fn submission_failed(&self, status_code: Option<u16>, cause: anyhow::Error) -> SubmissionError {
        self.events.record(
            "job_submit_failed",
            map_object(json!({
                "status_code": status_code,
                "reason": format!("{cause:#}"),
            })),
        );
        SubmissionError { status_code, cause }
    }

    fn follow(
        &self,
        job: &mut GenerationJob,
        notices: &dyn NoticeSink,
        cancel: &CancelToken,
    ) -> GenerationOutcome {
        let interval = self.poll.interval_seconds.max(1);
        let max_wait = self.poll.max_wait_seconds;

        while job.elapsed_seconds() < max_wait {
            if cancel.is_cancelled() {
                return self.cancelled(job);
            }
            let tick = interval.min(job.remaining(max_wait));
            if !self.clock.wait(Duration::from_secs(tick), cancel) {
                return self.cancelled(job);
            }
            job.advance(tick, max_wait);

            let response = match self.service.fetch(job.job_id()) {
                Ok(response) if response.is_ok() => response,
                Ok(response) => {
                    self.record_poll_error(
                        job,
                        format!(
                            "status {}: {}",
                            response.status_code,
                            response.message.as_deref().unwrap_or("no message")
                        ),
                    );
                    continue;
                }
                Err(err) => {
                    self.record_poll_error(job, format!("{err:#}"));
                    continue;
                }
            };

            let observed = JobStatus::from_remote(response.task_status.as_deref());
            if let Some(transition) = job.observe(observed) {
                self.events.record(
                    "job_status_changed",
                    map_object(json!({
                        "task_id": job.job_id(),
                        "from": transition.from,
                        "to": transition.to,
                        "elapsed_seconds": transition.elapsed_seconds,
                    })),
                );
            }

            if job.slow_queue_due(self.poll.slow_notice_after_seconds)
                && job.mark_slow_queue_notified()
            {
                let delivered = notices.offer(JobNotice::SlowQueue {
                    task_id: job.job_id().to_string(),
                    elapsed_seconds: job.elapsed_seconds(),
                });
                self.events.record(
                    "job_slow_queue_notice",
                    map_object(json!({
                        "task_id": job.job_id(),
                        "elapsed_seconds": job.elapsed_seconds(),
                        "delivered": delivered,
                    })),
                );
            }

            match job.status() {
                JobStatus::Succeeded => return self.succeeded(job, &response),
                JobStatus::Failed => {
                    let reason = response
                        .message
                        .as_deref()
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .unwrap_or("unknown error")
                        .to_string();
                    return self.failed(job, reason);
                }
                _ => {}
            }
        }

        self.timed_out(job, notices)
    }

    fn succeeded(&self, job: &GenerationJob, response: &FetchResponse) -> GenerationOutcome {
        let Some(url) = response.result_urls.first() else {
            return self.failed(job, MALFORMED_SUCCESS.to_string());
        };
        self.events.record(
            "job_succeeded",
            map_object(json!({
                "task_id": job.job_id(),
                "url": url,
                "elapsed_seconds": job.elapsed_seconds(),
            })),
        );
        GenerationOutcome::Succeeded {
            task_id: job.job_id().to_string(),
            url: url.clone(),
        }
    }

    fn failed(&self, job: &GenerationJob, reason: String) -> GenerationOutcome {
        self.events.record(
            "job_failed",
            map_object(json!({
                "task_id": job.job_id(),
                "reason": reason,
                "elapsed_seconds": job.elapsed_seconds(),
            })),
        );
        GenerationOutcome::Failed {
            task_id: job.job_id().to_string(),
            reason,
        }
    }

    fn timed_out(&self, job: &mut GenerationJob, notices: &dyn NoticeSink) -> GenerationOutcome {
        job.time_out();
        let task_id = job.job_id().to_string();
        let last_status = job.last_status();
        let elapsed_seconds = job.elapsed_seconds();
        let delivered = notices.offer(JobNotice::TimedOut {
            task_id: task_id.clone(),
            last_status,
            elapsed_seconds,
        });
        self.events.record(
            "job_timed_out",
            map_object(json!({
                "task_id": task_id,
                "last_status": last_status,
                "elapsed_seconds": elapsed_seconds,
                "delivered": delivered,
            })),
        );
        GenerationOutcome::TimedOut {
            task_id,
            last_status,
            elapsed_seconds,
        }
    }

    fn cancelled(&self, job: &GenerationJob) -> GenerationOutcome {
        self.events.record(
            "job_cancelled",
            map_object(json!({
                "task_id": job.job_id(),
                "elapsed_seconds": job.elapsed_seconds(),
            })),
        );
        GenerationOutcome::Cancelled {
            task_id: job.job_id().to_string(),
            elapsed_seconds: job.elapsed_seconds(),
        }
    }

    fn record_poll_error(&self, job: &GenerationJob, reason: String) {
        self.events.record(
            "job_poll_error",
            map_object(json!({
                "task_id": job.job_id(),
                "elapsed_seconds": job.elapsed_seconds(),
                "reason": reason,
            })),
        );
    }
}
