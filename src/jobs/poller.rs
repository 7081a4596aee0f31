//! Poller: the repeating status check for one job.
//!
//! The first check runs immediately, later ones every `interval`. Checks are
//! serialized: a tick that fires while a check is still awaiting the network
//! is delayed, never run alongside it. Each check's outcome is handed to the
//! `on_check` callback, which decides whether polling goes on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{GenerationBackend, JobHandles, RemoteStatus, StatusReport};
use crate::config::PollPolicy;
use crate::error::{CollaboratorError, JobError};
use crate::jobs::classifier::{ClassifiedError, classify};
use crate::jobs::model::JobRecord;

/// What the poller should do after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    Stop,
}

/// Handle to a running poller. Dropping it does not stop the task.
#[derive(Debug)]
pub struct PollerHandle {
    job_id: Uuid,
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl PollerHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Stop the poller. No status check starts after this returns; one in
    /// flight is dropped at its next await point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Start polling `handles` on `policy`'s schedule.
pub fn attach<F>(
    job_id: Uuid,
    handles: JobHandles,
    backend: Arc<dyn GenerationBackend>,
    policy: PollPolicy,
    mut on_check: F,
) -> PollerHandle
where
    F: FnMut(Result<StatusReport, CollaboratorError>) -> PollStep + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);

    let task = tokio::spawn(async move {
        debug!(
            job_id = %job_id,
            external_id = %handles.external_id,
            interval_ms = policy.interval.as_millis() as u64,
            max_attempts = policy.max_attempts,
            "Poller started"
        );

        let mut tick = tokio::time::interval(policy.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if flag.load(Ordering::Acquire) {
                debug!(job_id = %job_id, "Poller cancelled");
                return;
            }

            let outcome = backend.check_status(&handles).await;

            if flag.load(Ordering::Acquire) {
                debug!(job_id = %job_id, "Poller cancelled during check");
                return;
            }

            if on_check(outcome) == PollStep::Stop {
                debug!(job_id = %job_id, "Poller stopped");
                return;
            }
        }
    });

    PollerHandle {
        job_id,
        cancelled,
        abort: task.abort_handle(),
    }
}

/// Apply one status-check outcome to a polling record.
///
/// The attempt (and any progress) is recorded before the status is judged.
/// Transient failures leave the record polling; the attempt ceiling is
/// checked last, so a job that never settles times out on exactly the
/// `max_attempts`-th check.
pub fn evaluate_poll(
    record: &mut JobRecord,
    outcome: Result<StatusReport, CollaboratorError>,
    policy: &PollPolicy,
) -> PollStep {
    let progress = outcome.as_ref().ok().and_then(|report| report.progress);
    record.record_attempt(progress);

    match outcome {
        Ok(report) => match report.status {
            RemoteStatus::Succeeded => {
                let settled = match report.result.filter(|r| !r.trim().is_empty()) {
                    Some(result) => record.succeed(result),
                    None => record.fail(ClassifiedError::upstream_failure(
                        "upstream reported success without a result",
                    )),
                };
                return settle(record, settled);
            }
            RemoteStatus::Failed => {
                let message = report
                    .error
                    .unwrap_or_else(|| "generation failed upstream".to_string());
                let settled = record.fail(ClassifiedError::upstream_failure(message));
                return settle(record, settled);
            }
            RemoteStatus::Pending => {}
        },
        Err(raw) => {
            let classified = classify(&raw);
            if classified.transient {
                warn!(
                    key = %record.key,
                    job_id = %record.job_id,
                    attempt = record.attempts,
                    error = %classified.message,
                    "Transient status-check failure, retrying next tick"
                );
            } else {
                let settled = record.fail(classified);
                return settle(record, settled);
            }
        }
    }

    if record.attempts >= policy.max_attempts {
        let settled = record.time_out(ClassifiedError::timeout(policy));
        return settle(record, settled);
    }

    PollStep::Continue
}

fn settle(record: &JobRecord, outcome: Result<(), JobError>) -> PollStep {
    match outcome {
        Ok(()) => {
            info!(
                key = %record.key,
                job_id = %record.job_id,
                status = %record.status,
                attempts = record.attempts,
                "Job settled"
            );
        }
        Err(e) => {
            warn!(key = %record.key, job_id = %record.job_id, error = %e, "Poll outcome rejected");
        }
    }
    PollStep::Stop
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::classifier::ErrorKind;
    use crate::jobs::model::{GenerationRequest, JobKey, JobKind, JobStatus};

    fn polling_record() -> JobRecord {
        let mut record = JobRecord::new(JobKey::new("img-1"), JobKind::Image);
        record.begin_submission().unwrap();
        record.begin_polling(JobHandles::new("ext-1")).unwrap();
        record
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(3), max_attempts)
    }

    #[test]
    fn progress_recorded_before_status() {
        let mut record = polling_record();
        let step = evaluate_poll(&mut record, Ok(StatusReport::pending(Some(20))), &policy(5));
        assert_eq!(step, PollStep::Continue);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.progress, Some(20));
        assert_eq!(record.status, JobStatus::Polling);
    }

    #[test]
    fn success_sets_result() {
        let mut record = polling_record();
        let step = evaluate_poll(&mut record, Ok(StatusReport::succeeded("https://cdn/x.png")), &policy(5));
        assert_eq!(step, PollStep::Stop);
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result.as_deref(), Some("https://cdn/x.png"));
        record.check_invariants().unwrap();
    }

    #[test]
    fn success_without_result_is_a_failure() {
        let mut record = polling_record();
        let mut report = StatusReport::succeeded("");
        report.result = None;
        evaluate_poll(&mut record, Ok(report), &policy(5));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::UpstreamFailure);
    }

    #[test]
    fn upstream_failure_is_terminal() {
        let mut record = polling_record();
        let step = evaluate_poll(&mut record, Ok(StatusReport::failed("content policy")), &policy(5));
        assert_eq!(step, PollStep::Stop);
        let error = record.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::UpstreamFailure);
        assert_eq!(error.message, "content policy");
    }

    #[test]
    fn transient_errors_keep_polling() {
        let mut record = polling_record();
        let step = evaluate_poll(
            &mut record,
            Err(CollaboratorError::Http { status: 503, message: "busy".into() }),
            &policy(5),
        );
        assert_eq!(step, PollStep::Continue);
        assert_eq!(record.status, JobStatus::Polling);
        assert!(record.error.is_none());
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn resource_exhaustion_while_polling_fails() {
        let mut record = polling_record();
        evaluate_poll(
            &mut record,
            Err(CollaboratorError::Http { status: 402, message: "no credits".into() }),
            &policy(5),
        );
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.as_ref().unwrap().requires_top_up());
    }

    #[test]
    fn times_out_on_exactly_the_last_attempt() {
        let mut record = polling_record();
        for _ in 0..2 {
            assert_eq!(
                evaluate_poll(&mut record, Ok(StatusReport::pending(None)), &policy(3)),
                PollStep::Continue
            );
        }
        let step = evaluate_poll(
            &mut record,
            Err(CollaboratorError::Transport("reset".into())),
            &policy(3),
        );
        assert_eq!(step, PollStep::Stop);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.status, JobStatus::TimedOut);
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn success_on_last_attempt_wins_over_timeout() {
        let mut record = polling_record();
        evaluate_poll(&mut record, Ok(StatusReport::succeeded("r")), &policy(1));
        assert_eq!(record.status, JobStatus::Succeeded);
    }

    struct Scripted {
        replies: Mutex<VecDeque<StatusReport>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        async fn submit(
            &self,
            _kind: JobKind,
            _request: &GenerationRequest,
        ) -> Result<JobHandles, CollaboratorError> {
            Ok(JobHandles::new("ext-1"))
        }

        async fn check_status(&self, _handles: &JobHandles) -> Result<StatusReport, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| StatusReport::pending(None)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_check_is_immediate_then_every_interval() {
        let backend = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::from([
                StatusReport::pending(Some(10)),
                StatusReport::pending(Some(60)),
                StatusReport::succeeded("done"),
            ])),
            calls: AtomicU32::new(0),
        });
        let checks = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&checks);

        let handle = attach(
            Uuid::new_v4(),
            JobHandles::new("ext-1"),
            backend.clone(),
            policy(10),
            move |outcome| {
                let report = outcome.unwrap();
                let done = report.status == RemoteStatus::Succeeded;
                seen.lock().unwrap().push(report.progress);
                if done { PollStep::Stop } else { PollStep::Continue }
            },
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(handle.is_finished());
        assert_eq!(*checks.lock().unwrap(), vec![Some(10), Some(60), Some(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_further_checks() {
        let backend = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        });
        let handle = attach(
            Uuid::new_v4(),
            JobHandles::new("ext-1"),
            backend.clone(),
            policy(100),
            |_| PollStep::Continue,
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }
}
