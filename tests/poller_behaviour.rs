//! Behaviour of the completion poller and job waiter as seen by callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rstest::rstest;
use thiserror::Error;

use stowage::job::{JobOutcome, JobSnapshot};
use stowage::{Backoff, JobError, JobHandle, JobKind, Outcome, PollError, poll_until, wait_for_job};

#[derive(Debug, Error, Eq, PartialEq)]
#[error("condition broke")]
struct Broke;

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

#[tokio::test]
async fn pending_condition_is_invoked_exactly_steps_times() {
    let calls = counter();
    let seen = Arc::clone(&calls);
    let backoff = Backoff::new(Duration::from_millis(20), 1.0, 3);
    let started = Instant::now();

    let result = poll_until(backoff, || {
        seen.fetch_add(1, Ordering::SeqCst);
        async { Outcome::<(), Broke>::Pending }
    })
    .await;

    assert_eq!(result, Err(PollError::TimedOut { attempts: 3 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn failure_stops_polling_at_once() {
    let calls = counter();
    let seen = Arc::clone(&calls);

    let result = poll_until(Backoff::new(Duration::from_millis(1), 1.0, 10), || {
        let attempt = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 1 {
                Outcome::Failure(Broke)
            } else {
                Outcome::<u32, Broke>::Pending
            }
        }
    })
    .await;

    assert_eq!(result, Err(PollError::Condition(Broke)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn success_on_the_first_attempt_never_sleeps() {
    let started = Instant::now();

    let result = poll_until(Backoff::new(Duration::from_secs(30), 2.0, 5), || async {
        Outcome::<&str, Broke>::Success("done")
    })
    .await;

    assert_eq!(result, Ok("done"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

async fn run_job(kind: JobKind, statuses: &[&str]) -> Result<JobOutcome, JobError> {
    let script: Vec<String> = statuses.iter().map(|status| (*status).to_owned()).collect();
    let calls = counter();
    let job = JobHandle::new("job-1", kind);
    wait_for_job(&job, Backoff::new(Duration::from_millis(1), 1.0, 4), || {
        let index = calls.fetch_add(1, Ordering::SeqCst);
        let status = usize::try_from(index)
            .ok()
            .and_then(|position| script.get(position))
            .or_else(|| script.last())
            .cloned()
            .unwrap_or_default();
        async move {
            Ok(JobSnapshot {
                status,
                entity: Some(String::from("vol-1")),
                reason: None,
            })
        }
    })
    .await
}

#[rstest]
#[case::compute(JobKind::Compute, &["INIT", "RUNNING", "SUCCESS"])]
#[case::share(JobKind::ShareCreate, &["creating", "available"])]
#[case::turbo(JobKind::TurboExtend, &["121", "221"])]
#[tokio::test]
async fn jobs_finish_on_their_success_status(#[case] kind: JobKind, #[case] statuses: &[&str]) {
    let outcome = run_job(kind, statuses).await.expect("job succeeds");

    assert_eq!(outcome.entity.as_deref(), Some("vol-1"));
}

#[rstest]
#[case::compute(JobKind::Compute, &["RUNNING", "FAIL"])]
#[case::share(JobKind::ShareExtend, &["extending", "extending_error"])]
#[case::turbo(JobKind::TurboCreate, &["100", "303"])]
#[tokio::test]
async fn jobs_fail_on_their_failure_status(#[case] kind: JobKind, #[case] statuses: &[&str]) {
    let err = run_job(kind, statuses).await.expect_err("job fails");

    assert!(matches!(err, JobError::Failed { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn unknown_statuses_keep_waiting_until_the_budget_ends() {
    let err = run_job(JobKind::Compute, &["MIGRATING"])
        .await
        .expect_err("job times out");

    assert!(matches!(err, JobError::TimedOut { attempts: 4, .. }), "unexpected error: {err}");
}
